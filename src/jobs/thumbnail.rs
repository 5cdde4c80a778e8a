// Thumbnail job
//
// Extracts one poster frame at the configured seek point and encodes it at
// two widths. Outputs are written to a temp file and renamed into place.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{ThumbnailOptions, ThumbnailSeek};
use crate::constants::THUMB_FORMAT;
use crate::error::{Result, SiftError};
use crate::jobs::JobContext;
use crate::tools;

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailOutput {
    pub small_path: PathBuf,
    pub large_path: PathBuf,
    pub seek_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ThumbnailJob {
    pub item_id: i64,
    pub path: PathBuf,
    pub duration_secs: f64,
    pub output_dir: PathBuf,
    pub options: ThumbnailOptions,
}

impl ThumbnailJob {
    pub fn is_cancellable(&self) -> bool {
        true
    }

    pub fn execute(&self, ctx: &JobContext) -> Result<ThumbnailOutput> {
        let seek_secs = resolve_seek(&self.options.seek, self.duration_secs)?;
        std::fs::create_dir_all(&self.output_dir)?;

        let small_path = self.output_path(self.options.small_width);
        let large_path = self.output_path(self.options.large_width);

        extract_frame(ctx, &self.path, &small_path, seek_secs, self.options.small_width, self.options.quality)?;
        extract_frame(ctx, &self.path, &large_path, seek_secs, self.options.large_width, self.options.quality)?;

        Ok(ThumbnailOutput {
            small_path,
            large_path,
            seek_secs,
        })
    }

    fn output_path(&self, width: u32) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.{}", self.item_id, width, THUMB_FORMAT))
    }
}

/// Seek point in seconds. A point past the end of the item is an extraction
/// error, not something to clamp.
pub fn resolve_seek(seek: &ThumbnailSeek, duration_secs: f64) -> Result<f64> {
    let secs = match *seek {
        ThumbnailSeek::Absolute(s) => s,
        ThumbnailSeek::Percent(p) => {
            if !(0.0..=100.0).contains(&p) {
                return Err(SiftError::Invalid(format!("seek percent {} outside 0..100", p)));
            }
            duration_secs * p / 100.0
        }
    };
    if secs < 0.0 || !secs.is_finite() {
        return Err(SiftError::Invalid(format!("seek {} is not a valid position", secs)));
    }
    if secs > duration_secs {
        return Err(SiftError::Extraction(format!(
            "seek point {:.3}s exceeds duration {:.3}s",
            secs, duration_secs
        )));
    }
    Ok(secs)
}

/// FFmpeg quality scale is 1-31 where 1 is best; map our 0-100 onto it.
pub fn jpeg_qscale(quality: u32) -> u32 {
    let quality = quality.min(100);
    ((100 - quality) as f32 / 100.0 * 30.0 + 1.0) as u32
}

fn extract_frame(
    ctx: &JobContext,
    source: &Path,
    output_path: &Path,
    seek_secs: f64,
    width: u32,
    quality: u32,
) -> Result<()> {
    let tmp_path = output_path.with_extension(format!("tmp.{}", THUMB_FORMAT));
    let scale_filter = format!("scale='min({},iw)':-2", width);

    let mut cmd = Command::new(tools::ffmpeg_path());
    cmd.args(["-y", "-v", "error", "-ss", &format_timestamp(seek_secs), "-i"])
        .arg(source)
        .args([
            "-frames:v", "1",
            "-vf", &scale_filter,
            "-q:v", &jpeg_qscale(quality).to_string(),
        ])
        .arg(&tmp_path);

    let output = match tools::run_tool(cmd, "ffmpeg", ctx) {
        Ok(o) => o,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    if !output.status.success() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SiftError::Extraction(format!(
            "ffmpeg thumbnail failed: {}",
            output.stderr_tail()
        )));
    }

    let size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(SiftError::Extraction("thumbnail file is empty".to_string()));
    }

    // Atomic rename
    std::fs::rename(&tmp_path, output_path)?;
    Ok(())
}

/// Format seconds as HH:MM:SS.mmm for ffmpeg.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) as f64 / 1000.0;
    format!("{:02}:{:02}:{:06.3}", hours, minutes, secs)
}
