// Vidsift - Pipeline configuration
// Static process settings loaded once at startup from <data_dir>/config.json.
// Thresholds and trigger/retry rules live in the database instead so they can
// change without a restart.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Result;
use crate::jobs::Phase;

/// Per-phase worker counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhaseWorkers {
    pub metadata: usize,
    pub thumbnail: usize,
    pub sprites: usize,
    pub fingerprint: usize,
}

impl Default for PhaseWorkers {
    fn default() -> Self {
        Self {
            metadata: DEFAULT_METADATA_WORKERS,
            thumbnail: DEFAULT_THUMBNAIL_WORKERS,
            sprites: DEFAULT_SPRITES_WORKERS,
            fingerprint: DEFAULT_FINGERPRINT_WORKERS,
        }
    }
}

impl PhaseWorkers {
    pub fn for_phase(&self, phase: Phase) -> usize {
        match phase {
            Phase::Metadata => self.metadata,
            Phase::Thumbnail => self.thumbnail,
            Phase::Sprites => self.sprites,
            Phase::Fingerprint => self.fingerprint,
        }
    }
}

/// Per-phase timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PhaseTimeouts {
    pub metadata: u64,
    pub thumbnail: u64,
    pub sprites: u64,
    pub fingerprint: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            metadata: METADATA_TIMEOUT_SECS,
            thumbnail: THUMBNAIL_TIMEOUT_SECS,
            sprites: SPRITES_TIMEOUT_SECS,
            fingerprint: FINGERPRINT_TIMEOUT_SECS,
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> u64 {
        match phase {
            Phase::Metadata => self.metadata,
            Phase::Thumbnail => self.thumbnail,
            Phase::Sprites => self.sprites,
            Phase::Fingerprint => self.fingerprint,
        }
    }
}

/// Where the thumbnail frame is taken from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "value")]
pub enum ThumbnailSeek {
    /// Seconds from the start
    Absolute(f64),
    /// Percentage of the duration (0 to 100)
    Percent(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThumbnailOptions {
    pub seek: ThumbnailSeek,
    pub small_width: u32,
    pub large_width: u32,
    pub quality: u32,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            seek: ThumbnailSeek::Percent(THUMB_SEEK_PERCENT),
            small_width: THUMB_SMALL_WIDTH,
            large_width: THUMB_LARGE_WIDTH,
            quality: THUMB_QUALITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpriteOptions {
    pub interval_secs: f64,
    pub tile_width: u32,
    pub columns: u32,
    pub rows_per_sheet: u32,
    pub max_frames: u32,
    /// Concurrent frame extractions inside one sprites job
    pub extract_concurrency: usize,
    pub quality: u32,
}

impl Default for SpriteOptions {
    fn default() -> Self {
        Self {
            interval_secs: SPRITE_INTERVAL_SECS,
            tile_width: SPRITE_TILE_WIDTH,
            columns: SPRITE_COLUMNS,
            rows_per_sheet: SPRITE_ROWS_PER_SHEET,
            max_frames: SPRITE_MAX_FRAMES,
            extract_concurrency: SPRITE_EXTRACT_CONCURRENCY,
            quality: THUMB_QUALITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub workers: PhaseWorkers,
    pub queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub scheduler_tick_secs: u64,
    pub scheduled_batch_size: i64,
    pub claim_lease_secs: i64,
    pub history_retention_days: i64,
    pub timeouts: PhaseTimeouts,
    pub thumbnail: ThumbnailOptions,
    pub sprites: SpriteOptions,
    /// When false, fingerprints are still stored but no matching happens
    pub index_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workers: PhaseWorkers::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            scheduler_tick_secs: DEFAULT_SCHEDULER_TICK_SECS,
            scheduled_batch_size: DEFAULT_SCHEDULED_BATCH_SIZE,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            timeouts: PhaseTimeouts::default(),
            thumbnail: ThumbnailOptions::default(),
            sprites: SpriteOptions::default(),
            index_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Load config for a data directory. Missing file means defaults.
    pub fn load(data_dir: Option<&Path>) -> Result<Self> {
        let dir = match data_dir {
            Some(d) => d.to_path_buf(),
            None => default_data_dir(),
        };
        let path = dir.join(CONFIG_FILENAME);

        let mut config = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            serde_json::from_str::<PipelineConfig>(&json)?
        } else {
            PipelineConfig::default()
        };
        config.data_dir = dir;
        Ok(config)
    }

    /// Write the config back to <data_dir>/config.json.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.data_dir.join(CONFIG_FILENAME), json)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILENAME)
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_DB_FILENAME)
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.data_dir.join(THUMBS_FOLDER)
    }

    pub fn sprites_dir(&self) -> PathBuf {
        self.data_dir.join(SPRITES_FOLDER)
    }
}

/// Default data directory: $VIDSIFT_DATA_DIR, else the platform data dir.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    directories::ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".vidsift"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.workers.metadata, DEFAULT_METADATA_WORKERS);
        assert_eq!(config.thumbnail.seek, ThumbnailSeek::Percent(THUMB_SEEK_PERCENT));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"{"workers": {"fingerprint": 6}, "thumbnail": {"seek": {"mode": "absolute", "value": 12.5}}}"#,
        ).unwrap();

        let config = PipelineConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.workers.fingerprint, 6);
        assert_eq!(config.workers.metadata, DEFAULT_METADATA_WORKERS);
        assert_eq!(config.thumbnail.seek, ThumbnailSeek::Absolute(12.5));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::load(Some(dir.path())).unwrap();
        config.poll_interval_ms = 250;
        config.save().unwrap();

        let reloaded = PipelineConfig::load(Some(dir.path())).unwrap();
        assert_eq!(reloaded.poll_interval_ms, 250);
    }
}
