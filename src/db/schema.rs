// Database schema types and query helpers

use std::collections::BTreeMap;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, SiftError};
use crate::fingerprint::{self, FingerprintMode, FingerprintType};
use crate::jobs::fingerprint::FingerprintOutput;
use crate::jobs::metadata::MediaProbe;
use crate::jobs::Phase;
use crate::pipeline::triggers::{TriggerConfig, TriggerType};

/// "?, ?, ?" for an IN (...) list of `n` values
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ----- Defaults -----

/// Seed trigger, retry and duplication config rows that do not exist yet.
pub fn seed_defaults(conn: &Connection) -> anyhow::Result<()> {
    for config in TriggerConfig::defaults() {
        conn.execute(
            "INSERT OR IGNORE INTO trigger_config (phase, trigger_type, after_phase, cron_expr)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                config.phase.as_str(),
                config.trigger_type.as_str(),
                config.after_phase.map(|p| p.as_str()),
                config.cron_expr,
            ],
        )?;
    }

    for phase in Phase::ALL {
        let retry = RetryConfig::default_for(phase);
        conn.execute(
            "INSERT OR IGNORE INTO retry_config (phase, max_retries, initial_delay_secs, max_delay_secs, backoff_factor)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                phase.as_str(),
                retry.max_retries,
                retry.initial_delay_secs,
                retry.max_delay_secs,
                retry.backoff_factor,
            ],
        )?;
    }

    let dup = DuplicationConfig::default();
    conn.execute(
        "INSERT OR IGNORE INTO duplication_config (
            id, enabled, fingerprint_mode,
            audio_density_threshold, audio_min_hashes, audio_min_span, audio_delta_tolerance, audio_max_scene_freq,
            visual_density_threshold, visual_min_frames, visual_min_span, visual_delta_tolerance, visual_hamming_max,
            codec_bonus)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            dup.enabled,
            dup.fingerprint_mode.as_str(),
            dup.audio_density_threshold,
            dup.audio_min_hashes,
            dup.audio_min_span,
            dup.audio_delta_tolerance,
            dup.audio_max_scene_freq,
            dup.visual_density_threshold,
            dup.visual_min_frames,
            dup.visual_min_span,
            dup.visual_delta_tolerance,
            dup.visual_hamming_max,
            serde_json::to_string(&dup.codec_bonus)?,
        ],
    )?;
    Ok(())
}

// ----- Items -----

/// Coarse rollup shown to end users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub path: String,
    pub title: String,
    pub size_bytes: i64,
    pub duration_secs: f64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<f64>,
    pub bit_rate: Option<i64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub processing_status: String,
    pub metadata_done: bool,
    pub thumbnail_done: bool,
    pub sprites_done: bool,
    pub fingerprint_done: bool,
    pub thumbnail_path: Option<String>,
    pub sprite_vtt_path: Option<String>,
    pub fingerprint_type: Option<String>,
    pub fingerprinted_at: Option<String>,
    pub trashed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Item {
    pub fn phase_done(&self, phase: Phase) -> bool {
        match phase {
            Phase::Metadata => self.metadata_done,
            Phase::Thumbnail => self.thumbnail_done,
            Phase::Sprites => self.sprites_done,
            Phase::Fingerprint => self.fingerprint_done,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub path: String,
    pub title: String,
    pub size_bytes: i64,
}

const ITEM_COLUMNS: &str = "id, path, title, size_bytes, duration_secs, width, height, frame_rate, bit_rate,
    video_codec, audio_codec, processing_status, metadata_done, thumbnail_done, sprites_done,
    fingerprint_done, thumbnail_path, sprite_vtt_path, fingerprint_type, fingerprinted_at,
    trashed_at, created_at, updated_at";

fn map_item(row: &rusqlite::Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        path: row.get(1)?,
        title: row.get(2)?,
        size_bytes: row.get(3)?,
        duration_secs: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        frame_rate: row.get(7)?,
        bit_rate: row.get(8)?,
        video_codec: row.get(9)?,
        audio_codec: row.get(10)?,
        processing_status: row.get(11)?,
        metadata_done: row.get(12)?,
        thumbnail_done: row.get(13)?,
        sprites_done: row.get(14)?,
        fingerprint_done: row.get(15)?,
        thumbnail_path: row.get(16)?,
        sprite_vtt_path: row.get(17)?,
        fingerprint_type: row.get(18)?,
        fingerprinted_at: row.get(19)?,
        trashed_at: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

pub fn insert_item(conn: &Connection, item: &NewItem) -> Result<i64> {
    conn.execute(
        "INSERT INTO items (path, title, size_bytes) VALUES (?1, ?2, ?3)",
        params![item.path, item.title, item.size_bytes],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_item(conn: &Connection, id: i64) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS);
    let result = conn.query_row(&sql, params![id], map_item).optional()?;
    Ok(result)
}

pub fn get_item_by_path(conn: &Connection, path: &str) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM items WHERE path = ?1", ITEM_COLUMNS);
    let result = conn.query_row(&sql, params![path], map_item).optional()?;
    Ok(result)
}

/// Non-trashed items, optionally filtered by processing status.
pub fn list_items(conn: &Connection, status: Option<&str>, limit: i64) -> Result<Vec<Item>> {
    let sql = format!(
        "SELECT {} FROM items
         WHERE trashed_at IS NULL AND (?1 IS NULL OR processing_status = ?1)
         ORDER BY id LIMIT ?2",
        ITEM_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![status, limit], map_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub fn update_item_metadata(conn: &Connection, id: i64, probe: &MediaProbe) -> Result<()> {
    conn.execute(
        "UPDATE items SET duration_secs = ?1, width = ?2, height = ?3, frame_rate = ?4, bit_rate = ?5,
                video_codec = ?6, audio_codec = ?7, updated_at = datetime('now')
         WHERE id = ?8",
        params![
            probe.duration_secs,
            probe.width,
            probe.height,
            probe.frame_rate,
            probe.bit_rate,
            probe.video_codec,
            probe.audio_codec,
            id,
        ],
    )?;
    Ok(())
}

pub fn update_item_thumbnail(conn: &Connection, id: i64, thumbnail_path: &str) -> Result<()> {
    conn.execute(
        "UPDATE items SET thumbnail_path = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![thumbnail_path, id],
    )?;
    Ok(())
}

pub fn update_item_sprites(conn: &Connection, id: i64, vtt_path: &str) -> Result<()> {
    conn.execute(
        "UPDATE items SET sprite_vtt_path = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![vtt_path, id],
    )?;
    Ok(())
}

/// Persist fingerprint blobs. A type that was not extracted is cleared.
pub fn store_fingerprints(conn: &Connection, id: i64, output: &FingerprintOutput) -> Result<()> {
    let audio = output.audio.as_deref().map(fingerprint::encode_audio);
    let visual = output.visual.as_deref().map(fingerprint::encode_visual);
    conn.execute(
        "UPDATE items SET audio_fingerprint = ?1, visual_fingerprint = ?2, fingerprint_type = ?3,
                fingerprinted_at = datetime('now'), updated_at = datetime('now')
         WHERE id = ?4",
        params![audio, visual, output.fingerprint_type.as_str(), id],
    )?;
    Ok(())
}

/// Fingerprints stored on an item
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredFingerprints {
    pub audio: Option<Vec<i32>>,
    pub visual: Option<Vec<u64>>,
    pub fingerprint_type: Option<FingerprintType>,
}

pub fn get_item_fingerprints(conn: &Connection, id: i64) -> Result<Option<StoredFingerprints>> {
    let row = conn
        .query_row(
            "SELECT audio_fingerprint, visual_fingerprint, fingerprint_type FROM items WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((audio, visual, fp_type)) = row else {
        return Ok(None);
    };
    Ok(Some(StoredFingerprints {
        audio: audio.as_deref().map(fingerprint::decode_audio).transpose()?,
        visual: visual.as_deref().map(fingerprint::decode_visual).transpose()?,
        fingerprint_type: fp_type.as_deref().map(FingerprintType::parse).transpose()?,
    }))
}

pub fn set_phase_done(conn: &Connection, id: i64, phase: Phase, done: bool) -> Result<()> {
    let sql = format!(
        "UPDATE items SET {} = ?1, updated_at = datetime('now') WHERE id = ?2",
        phase.done_column()
    );
    conn.execute(&sql, params![done, id])?;
    Ok(())
}

/// Recompute the processing_status rollup from queue, DLQ and phase flags.
pub fn refresh_processing_status(conn: &Connection, id: i64) -> Result<ProcessingStatus> {
    let (running, queued): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(status = 'running'), 0), COUNT(*) FROM job_queue WHERE item_id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let metadata_done: bool = conn
        .query_row("SELECT metadata_done FROM items WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| SiftError::NotFound(format!("item {}", id)))?;

    let status = if has_pending_dead_letter(conn, id)? {
        ProcessingStatus::Failed
    } else if running > 0 {
        ProcessingStatus::Processing
    } else if queued == 0 && metadata_done {
        ProcessingStatus::Completed
    } else {
        ProcessingStatus::Pending
    };

    conn.execute(
        "UPDATE items SET processing_status = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    Ok(status)
}

/// Soft delete. Returns false if the item was missing or already trashed.
pub fn trash_item(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE items SET trashed_at = datetime('now'), updated_at = datetime('now')
         WHERE id = ?1 AND trashed_at IS NULL",
        params![id],
    )?;
    Ok(rows > 0)
}

pub fn delete_item_row(conn: &Connection, id: i64) -> Result<bool> {
    let rows = conn.execute("DELETE FROM items WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

/// Items that have not completed `phase`, have nothing queued for it and
/// satisfy its prerequisites. Used by scheduled triggers and bulk reprocess.
pub fn items_needing_phase(conn: &Connection, phase: Phase, limit: i64) -> Result<Vec<i64>> {
    let prerequisite = match phase {
        Phase::Metadata => "",
        _ => "AND i.metadata_done = 1 AND i.duration_secs > 0",
    };
    let sql = format!(
        "SELECT i.id FROM items i
         WHERE i.trashed_at IS NULL AND i.{done} = 0 {prerequisite}
           AND NOT EXISTS (SELECT 1 FROM job_queue q WHERE q.item_id = i.id AND q.phase = ?1)
         ORDER BY i.id LIMIT ?2",
        done = phase.done_column(),
        prerequisite = prerequisite,
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params![phase.as_str(), limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

// ----- Tags / actors -----

pub fn add_item_tag(conn: &Connection, item_id: i64, name: &str) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO tags (name) VALUES (?1)", params![name])?;
    conn.execute(
        "INSERT OR IGNORE INTO item_tags (item_id, tag_id) SELECT ?1, id FROM tags WHERE name = ?2",
        params![item_id, name],
    )?;
    Ok(())
}

pub fn list_item_tags(conn: &Connection, item_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT t.name FROM tags t JOIN item_tags it ON it.tag_id = t.id
         WHERE it.item_id = ?1 ORDER BY t.name",
    )?;
    let names = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

pub fn add_item_actor(conn: &Connection, item_id: i64, name: &str) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO actors (name) VALUES (?1)", params![name])?;
    conn.execute(
        "INSERT OR IGNORE INTO item_actors (item_id, actor_id) SELECT ?1, id FROM actors WHERE name = ?2",
        params![item_id, name],
    )?;
    Ok(())
}

pub fn list_item_actors(conn: &Connection, item_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT a.name FROM actors a JOIN item_actors ia ON ia.actor_id = a.id
         WHERE ia.item_id = ?1 ORDER BY a.name",
    )?;
    let names = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

/// Copy tags and actors of `sources` onto `target`. Additive only.
pub fn merge_metadata_into(conn: &Connection, target: i64, sources: &[i64]) -> Result<()> {
    if sources.is_empty() {
        return Ok(());
    }
    let ph = placeholders(sources.len());
    let mut args: Vec<i64> = Vec::with_capacity(sources.len() + 1);
    args.push(target);
    args.extend_from_slice(sources);

    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO item_tags (item_id, tag_id)
             SELECT DISTINCT ?, tag_id FROM item_tags WHERE item_id IN ({})",
            ph
        ),
        params_from_iter(args.iter()),
    )?;
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO item_actors (item_id, actor_id)
             SELECT DISTINCT ?, actor_id FROM item_actors WHERE item_id IN ({})",
            ph
        ),
        params_from_iter(args.iter()),
    )?;
    Ok(())
}

// ----- Job queue -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: i64,
    pub item_id: i64,
    pub phase: String,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub not_before: String,
    pub job_id: Option<String>,
    pub claimed_by: Option<String>,
    pub run_token: Option<String>,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
}

const QUEUE_COLUMNS: &str = "id, item_id, phase, status, priority, attempts, last_error, not_before,
    job_id, claimed_by, run_token, lease_expires_at, created_at, started_at";

fn map_queue_row(row: &rusqlite::Row) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        item_id: row.get(1)?,
        phase: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        not_before: row.get(7)?,
        job_id: row.get(8)?,
        claimed_by: row.get(9)?,
        run_token: row.get(10)?,
        lease_expires_at: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
    })
}

/// Insert a pending row unless one already exists for (item, phase).
/// Returns true if a row was inserted.
pub fn enqueue_job(conn: &Connection, item_id: i64, phase: Phase, priority: i32) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO job_queue (item_id, phase, priority) VALUES (?1, ?2, ?3)",
        params![item_id, phase.as_str(), priority],
    )?;
    Ok(rows > 0)
}

/// Atomically claim the next due pending row for a phase.
pub fn claim_next(
    conn: &Connection,
    phase: Phase,
    worker_id: &str,
    job_id: &str,
    run_token: &str,
    lease_secs: i64,
) -> Result<Option<QueueRow>> {
    let sql = format!(
        "UPDATE job_queue
         SET status = 'running',
             job_id = ?1,
             claimed_by = ?2,
             run_token = ?3,
             lease_expires_at = datetime('now', ?4),
             started_at = datetime('now')
         WHERE id = (
             SELECT q.id FROM job_queue q JOIN items i ON i.id = q.item_id
             WHERE q.phase = ?5
               AND q.status = 'pending'
               AND q.not_before <= datetime('now')
               AND i.trashed_at IS NULL
             ORDER BY q.priority DESC, q.id ASC
             LIMIT 1
         )
         RETURNING {}",
        QUEUE_COLUMNS
    );
    let lease = format!("{:+} seconds", lease_secs);
    let row = conn
        .query_row(&sql, params![job_id, worker_id, run_token, lease, phase.as_str()], map_queue_row)
        .optional()?;
    Ok(row)
}

pub fn get_queue_row(conn: &Connection, id: i64) -> Result<Option<QueueRow>> {
    let sql = format!("SELECT {} FROM job_queue WHERE id = ?1", QUEUE_COLUMNS);
    let row = conn.query_row(&sql, params![id], map_queue_row).optional()?;
    Ok(row)
}

pub fn list_queue(conn: &Connection, limit: i64) -> Result<Vec<QueueRow>> {
    let sql = format!(
        "SELECT {} FROM job_queue ORDER BY status DESC, priority DESC, id LIMIT ?1",
        QUEUE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit], map_queue_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Rows for (item, phase): 0 or 1.
pub fn queue_depth(conn: &Connection, item_id: i64, phase: Phase) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM job_queue WHERE item_id = ?1 AND phase = ?2",
        params![item_id, phase.as_str()],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Total rows in the queue, optionally only those already due.
pub fn count_queue(conn: &Connection, due_only: bool) -> Result<i64> {
    let sql = if due_only {
        "SELECT COUNT(*) FROM job_queue WHERE status = 'running' OR not_before <= datetime('now')"
    } else {
        "SELECT COUNT(*) FROM job_queue"
    };
    let n = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n)
}

/// Finished: drop the row. Only the holder of the run token may do this.
pub fn complete_queue_row(conn: &Connection, id: i64, run_token: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM job_queue WHERE id = ?1 AND run_token = ?2",
        params![id, run_token],
    )?;
    Ok(rows > 0)
}

/// Give the claim back without consuming an attempt (shutdown, full pool).
pub fn release_claim(conn: &Connection, id: i64, run_token: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE job_queue SET status = 'pending', job_id = NULL, claimed_by = NULL, run_token = NULL,
                lease_expires_at = NULL, started_at = NULL, cancel_requested = 0
         WHERE id = ?1 AND run_token = ?2",
        params![id, run_token],
    )?;
    Ok(rows > 0)
}

/// Put a failed row back to pending after `delay_secs`, counting the attempt.
pub fn requeue_with_backoff(
    conn: &Connection,
    id: i64,
    run_token: &str,
    attempts: i32,
    error: &str,
    delay_secs: i64,
) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE job_queue SET status = 'pending', attempts = ?1, last_error = ?2,
                not_before = datetime('now', ?3),
                job_id = NULL, claimed_by = NULL, run_token = NULL, lease_expires_at = NULL, started_at = NULL,
                cancel_requested = 0
         WHERE id = ?4 AND run_token = ?5",
        params![attempts, error, format!("{:+} seconds", delay_secs), id, run_token],
    )?;
    Ok(rows > 0)
}

/// Reclaim running rows whose lease expired (their worker died).
pub fn reclaim_expired_claims(conn: &Connection) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE job_queue SET status = 'pending', job_id = NULL, claimed_by = NULL, run_token = NULL,
                lease_expires_at = NULL, started_at = NULL, cancel_requested = 0
         WHERE status = 'running' AND lease_expires_at < datetime('now')",
        [],
    )?;
    Ok(rows)
}

/// Release every claim held by a worker id (startup after an unclean exit).
pub fn release_claims_by(conn: &Connection, worker_id: &str) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE job_queue SET status = 'pending', job_id = NULL, claimed_by = NULL, run_token = NULL,
                lease_expires_at = NULL, started_at = NULL, cancel_requested = 0
         WHERE status = 'running' AND claimed_by = ?1",
        params![worker_id],
    )?;
    Ok(rows)
}

/// Flag a running job for cancellation by whichever process holds it.
/// Returns false if no running row carries that job id.
pub fn request_cancel(conn: &Connection, job_id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE job_queue SET cancel_requested = 1 WHERE job_id = ?1 AND status = 'running'",
        params![job_id],
    )?;
    Ok(rows > 0)
}

/// Job ids flagged for cancellation among a worker's claims in one phase.
pub fn cancel_requests(conn: &Connection, worker_id: &str, phase: Phase) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT job_id FROM job_queue
         WHERE cancel_requested = 1 AND status = 'running' AND claimed_by = ?1 AND phase = ?2
           AND job_id IS NOT NULL",
    )?;
    let ids = stmt
        .query_map(params![worker_id, phase.as_str()], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

pub fn delete_queue_rows_for_item(conn: &Connection, item_id: i64) -> Result<usize> {
    let rows = conn.execute("DELETE FROM job_queue WHERE item_id = ?1", params![item_id])?;
    Ok(rows)
}

// ----- Pool sizes -----

pub fn set_pool_workers(conn: &Connection, phase: Phase, workers: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO pool_workers (phase, workers) VALUES (?1, ?2)
         ON CONFLICT(phase) DO UPDATE SET workers = excluded.workers, updated_at = datetime('now')",
        params![phase.as_str(), workers as i64],
    )?;
    Ok(())
}

/// Worker count set at runtime for a phase, if any.
pub fn get_pool_workers(conn: &Connection, phase: Phase) -> Result<Option<usize>> {
    let workers: Option<i64> = conn
        .query_row(
            "SELECT workers FROM pool_workers WHERE phase = ?1",
            params![phase.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(workers.map(|n| n.max(1) as usize))
}

// ----- Job history -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub id: i64,
    pub job_id: String,
    pub item_id: i64,
    pub phase: String,
    pub status: String,
    pub attempt: i32,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: String,
}

#[derive(Debug, Clone)]
pub struct NewJobHistory {
    pub job_id: String,
    pub item_id: i64,
    pub phase: Phase,
    pub status: &'static str,
    pub attempt: i32,
    pub error_kind: Option<&'static str>,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: String,
}

pub fn insert_job_history(conn: &Connection, entry: &NewJobHistory) -> Result<i64> {
    conn.execute(
        "INSERT INTO job_history (job_id, item_id, phase, status, attempt, error_kind, error_message, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.job_id,
            entry.item_id,
            entry.phase.as_str(),
            entry.status,
            entry.attempt,
            entry.error_kind,
            entry.error_message,
            entry.started_at,
            entry.finished_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_job_history(conn: &Connection, item_id: Option<i64>, limit: i64) -> Result<Vec<JobHistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, job_id, item_id, phase, status, attempt, error_kind, error_message, started_at, finished_at
         FROM job_history
         WHERE (?1 IS NULL OR item_id = ?1)
         ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![item_id, limit], |row| {
            Ok(JobHistoryEntry {
                id: row.get(0)?,
                job_id: row.get(1)?,
                item_id: row.get(2)?,
                phase: row.get(3)?,
                status: row.get(4)?,
                attempt: row.get(5)?,
                error_kind: row.get(6)?,
                error_message: row.get(7)?,
                started_at: row.get(8)?,
                finished_at: row.get(9)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_job_history(conn: &Connection) -> Result<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM job_history", [], |row| row.get(0))?;
    Ok(n)
}

/// Delete history older than the retention window.
pub fn prune_job_history(conn: &Connection, retention_days: i64) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM job_history WHERE finished_at < datetime('now', ?1)",
        params![format!("-{} days", retention_days)],
    )?;
    Ok(rows)
}

// ----- Trigger config -----

fn map_trigger(row: &rusqlite::Row) -> rusqlite::Result<(String, String, Option<String>, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn trigger_from_parts(parts: (String, String, Option<String>, Option<String>)) -> Result<TriggerConfig> {
    let (phase, trigger_type, after_phase, cron_expr) = parts;
    Ok(TriggerConfig {
        phase: Phase::parse(&phase)?,
        trigger_type: TriggerType::parse(&trigger_type)?,
        after_phase: after_phase.as_deref().map(Phase::parse).transpose()?,
        cron_expr,
    })
}

pub fn list_trigger_configs(conn: &Connection) -> Result<Vec<TriggerConfig>> {
    let mut stmt = conn.prepare(
        "SELECT phase, trigger_type, after_phase, cron_expr FROM trigger_config ORDER BY phase",
    )?;
    let parts = stmt
        .query_map([], map_trigger)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    parts.into_iter().map(trigger_from_parts).collect()
}

pub fn get_trigger_config(conn: &Connection, phase: Phase) -> Result<Option<TriggerConfig>> {
    let parts = conn
        .query_row(
            "SELECT phase, trigger_type, after_phase, cron_expr FROM trigger_config WHERE phase = ?1",
            params![phase.as_str()],
            map_trigger,
        )
        .optional()?;
    parts.map(trigger_from_parts).transpose()
}

/// Write a trigger row. Validation (cycles, cron syntax) is the caller's job.
pub fn upsert_trigger_config(conn: &Connection, config: &TriggerConfig) -> Result<()> {
    conn.execute(
        "INSERT INTO trigger_config (phase, trigger_type, after_phase, cron_expr, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(phase) DO UPDATE SET
            trigger_type = excluded.trigger_type,
            after_phase = excluded.after_phase,
            cron_expr = excluded.cron_expr,
            updated_at = excluded.updated_at",
        params![
            config.phase.as_str(),
            config.trigger_type.as_str(),
            config.after_phase.map(|p| p.as_str()),
            config.cron_expr,
        ],
    )?;
    Ok(())
}

// ----- Retry config -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub phase: Phase,
    pub max_retries: i32,
    pub initial_delay_secs: i64,
    pub max_delay_secs: i64,
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub fn default_for(phase: Phase) -> Self {
        Self {
            phase,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_secs: DEFAULT_INITIAL_BACKOFF_SECS,
            max_delay_secs: DEFAULT_MAX_BACKOFF_SECS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    /// initial * factor^attempt, capped at max. `attempt` counts from 0.
    pub fn backoff_secs(&self, attempt: i32) -> i64 {
        let raw = self.initial_delay_secs as f64 * self.backoff_factor.powi(attempt.max(0));
        if !raw.is_finite() || raw >= self.max_delay_secs as f64 {
            self.max_delay_secs
        } else {
            raw.max(0.0) as i64
        }
    }
}

pub fn get_retry_config(conn: &Connection, phase: Phase) -> Result<RetryConfig> {
    let config = conn
        .query_row(
            "SELECT max_retries, initial_delay_secs, max_delay_secs, backoff_factor
             FROM retry_config WHERE phase = ?1",
            params![phase.as_str()],
            |row| {
                Ok(RetryConfig {
                    phase,
                    max_retries: row.get(0)?,
                    initial_delay_secs: row.get(1)?,
                    max_delay_secs: row.get(2)?,
                    backoff_factor: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(config.unwrap_or_else(|| RetryConfig::default_for(phase)))
}

pub fn upsert_retry_config(conn: &Connection, config: &RetryConfig) -> Result<()> {
    conn.execute(
        "INSERT INTO retry_config (phase, max_retries, initial_delay_secs, max_delay_secs, backoff_factor)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(phase) DO UPDATE SET
            max_retries = excluded.max_retries,
            initial_delay_secs = excluded.initial_delay_secs,
            max_delay_secs = excluded.max_delay_secs,
            backoff_factor = excluded.backoff_factor",
        params![
            config.phase.as_str(),
            config.max_retries,
            config.initial_delay_secs,
            config.max_delay_secs,
            config.backoff_factor,
        ],
    )?;
    Ok(())
}

// ----- Dead letter queue -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub item_id: i64,
    pub phase: String,
    pub error_kind: String,
    pub error_message: String,
    pub attempts: i32,
    pub status: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

fn map_dead_letter(row: &rusqlite::Row) -> rusqlite::Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
        id: row.get(0)?,
        item_id: row.get(1)?,
        phase: row.get(2)?,
        error_kind: row.get(3)?,
        error_message: row.get(4)?,
        attempts: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        resolved_at: row.get(8)?,
    })
}

pub fn insert_dead_letter(
    conn: &Connection,
    item_id: i64,
    phase: Phase,
    error_kind: &str,
    error_message: &str,
    attempts: i32,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO dead_letter_queue (item_id, phase, error_kind, error_message, attempts)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![item_id, phase.as_str(), error_kind, error_message, attempts],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_dead_letter(conn: &Connection, id: i64) -> Result<Option<DeadLetterEntry>> {
    let entry = conn
        .query_row(
            "SELECT id, item_id, phase, error_kind, error_message, attempts, status, created_at, resolved_at
             FROM dead_letter_queue WHERE id = ?1",
            params![id],
            map_dead_letter,
        )
        .optional()?;
    Ok(entry)
}

pub fn list_dead_letters(conn: &Connection, status: Option<&str>, limit: i64) -> Result<Vec<DeadLetterEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, item_id, phase, error_kind, error_message, attempts, status, created_at, resolved_at
         FROM dead_letter_queue
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![status, limit], map_dead_letter)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Move a pending entry to `retried` or `abandoned`.
pub fn resolve_dead_letter(conn: &Connection, id: i64, status: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE dead_letter_queue SET status = ?1, resolved_at = datetime('now')
         WHERE id = ?2 AND status = 'pending'",
        params![status, id],
    )?;
    Ok(rows > 0)
}

pub fn has_pending_dead_letter(conn: &Connection, item_id: i64) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dead_letter_queue WHERE item_id = ?1 AND status = 'pending'",
        params![item_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

// ----- Duplication config -----

/// Runtime-tunable matching thresholds (singleton row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicationConfig {
    pub enabled: bool,
    pub fingerprint_mode: FingerprintMode,
    pub audio_density_threshold: f64,
    pub audio_min_hashes: i64,
    pub audio_min_span: i64,
    pub audio_delta_tolerance: i64,
    pub audio_max_scene_freq: i64,
    pub visual_density_threshold: f64,
    pub visual_min_frames: i64,
    pub visual_min_span: i64,
    pub visual_delta_tolerance: i64,
    pub visual_hamming_max: u32,
    /// Lowercase codec name -> score bonus
    pub codec_bonus: BTreeMap<String, i64>,
}

impl Default for DuplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fingerprint_mode: FingerprintMode::AudioOnly,
            audio_density_threshold: AUDIO_DENSITY_THRESHOLD,
            audio_min_hashes: AUDIO_MIN_HASHES,
            audio_min_span: AUDIO_MIN_SPAN,
            audio_delta_tolerance: AUDIO_DELTA_TOLERANCE,
            audio_max_scene_freq: AUDIO_MAX_SCENE_FREQ,
            visual_density_threshold: VISUAL_DENSITY_THRESHOLD,
            visual_min_frames: VISUAL_MIN_FRAMES,
            visual_min_span: VISUAL_MIN_SPAN,
            visual_delta_tolerance: VISUAL_DELTA_TOLERANCE,
            visual_hamming_max: VISUAL_HAMMING_MAX,
            codec_bonus: DEFAULT_CODEC_BONUS
                .iter()
                .map(|(codec, bonus)| (codec.to_string(), *bonus))
                .collect(),
        }
    }
}

pub fn get_duplication_config(conn: &Connection) -> Result<DuplicationConfig> {
    let row = conn
        .query_row(
            "SELECT enabled, fingerprint_mode,
                    audio_density_threshold, audio_min_hashes, audio_min_span, audio_delta_tolerance, audio_max_scene_freq,
                    visual_density_threshold, visual_min_frames, visual_min_span, visual_delta_tolerance, visual_hamming_max,
                    codec_bonus
             FROM duplication_config WHERE id = 1",
            [],
            |row| {
                Ok((
                    DuplicationConfig {
                        enabled: row.get(0)?,
                        fingerprint_mode: FingerprintMode::AudioOnly,
                        audio_density_threshold: row.get(2)?,
                        audio_min_hashes: row.get(3)?,
                        audio_min_span: row.get(4)?,
                        audio_delta_tolerance: row.get(5)?,
                        audio_max_scene_freq: row.get(6)?,
                        visual_density_threshold: row.get(7)?,
                        visual_min_frames: row.get(8)?,
                        visual_min_span: row.get(9)?,
                        visual_delta_tolerance: row.get(10)?,
                        visual_hamming_max: row.get(11)?,
                        codec_bonus: BTreeMap::new(),
                    },
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(12)?,
                ))
            },
        )
        .optional()?;

    let Some((mut config, mode, codec_json)) = row else {
        return Ok(DuplicationConfig::default());
    };
    config.fingerprint_mode = FingerprintMode::parse(&mode)?;
    config.codec_bonus = serde_json::from_str(&codec_json)?;
    Ok(config)
}

pub fn update_duplication_config(conn: &Connection, config: &DuplicationConfig) -> Result<()> {
    if config.audio_delta_tolerance <= 0 || config.visual_delta_tolerance <= 0 {
        return Err(SiftError::Invalid("delta tolerance must be positive".to_string()));
    }
    conn.execute(
        "UPDATE duplication_config SET
            enabled = ?1, fingerprint_mode = ?2,
            audio_density_threshold = ?3, audio_min_hashes = ?4, audio_min_span = ?5,
            audio_delta_tolerance = ?6, audio_max_scene_freq = ?7,
            visual_density_threshold = ?8, visual_min_frames = ?9, visual_min_span = ?10,
            visual_delta_tolerance = ?11, visual_hamming_max = ?12,
            codec_bonus = ?13, updated_at = datetime('now')
         WHERE id = 1",
        params![
            config.enabled,
            config.fingerprint_mode.as_str(),
            config.audio_density_threshold,
            config.audio_min_hashes,
            config.audio_min_span,
            config.audio_delta_tolerance,
            config.audio_max_scene_freq,
            config.visual_density_threshold,
            config.visual_min_frames,
            config.visual_min_span,
            config.visual_delta_tolerance,
            config.visual_hamming_max,
            serde_json::to_string(&config.codec_bonus)?,
        ],
    )?;
    Ok(())
}

// ----- Duplicate groups -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub status: String,
    pub scene_count: i64,
    pub best_item_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: i64,
    pub item_id: i64,
    pub is_best: bool,
    pub confidence: f64,
    pub match_type: String,
    pub is_open: bool,
}

fn map_group(row: &rusqlite::Row) -> rusqlite::Result<DuplicateGroup> {
    Ok(DuplicateGroup {
        id: row.get(0)?,
        status: row.get(1)?,
        scene_count: row.get(2)?,
        best_item_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

pub fn create_group(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO duplicate_groups (status) VALUES ('unresolved')", [])?;
    Ok(conn.last_insert_rowid())
}

pub fn get_group(conn: &Connection, id: i64) -> Result<Option<DuplicateGroup>> {
    let group = conn
        .query_row(
            "SELECT id, status, scene_count, best_item_id, created_at, updated_at, resolved_at
             FROM duplicate_groups WHERE id = ?1",
            params![id],
            map_group,
        )
        .optional()?;
    Ok(group)
}

pub fn list_groups(conn: &Connection, status: Option<&str>, limit: i64) -> Result<Vec<DuplicateGroup>> {
    let mut stmt = conn.prepare(
        "SELECT id, status, scene_count, best_item_id, created_at, updated_at, resolved_at
         FROM duplicate_groups
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY id LIMIT ?2",
    )?;
    let groups = stmt
        .query_map(params![status, limit], map_group)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(groups)
}

pub fn get_group_members(conn: &Connection, group_id: i64) -> Result<Vec<GroupMember>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, item_id, is_best, confidence, match_type, is_open
         FROM duplicate_group_members WHERE group_id = ?1 ORDER BY item_id",
    )?;
    let members = stmt
        .query_map(params![group_id], |row| {
            Ok(GroupMember {
                group_id: row.get(0)?,
                item_id: row.get(1)?,
                is_best: row.get(2)?,
                confidence: row.get(3)?,
                match_type: row.get(4)?,
                is_open: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(members)
}

/// Distinct unresolved groups holding any of `item_ids`, lowest id first.
pub fn open_groups_for_items(conn: &Connection, item_ids: &[i64]) -> Result<Vec<i64>> {
    if item_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT group_id FROM duplicate_group_members
         WHERE is_open = 1 AND item_id IN ({}) ORDER BY group_id",
        placeholders(item_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(item_ids.iter()), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Add an item to a group, or raise its confidence if already a member.
pub fn upsert_group_member(
    conn: &Connection,
    group_id: i64,
    item_id: i64,
    confidence: f64,
    match_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO duplicate_group_members (group_id, item_id, confidence, match_type)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(group_id, item_id) DO UPDATE SET
            confidence = MAX(confidence, excluded.confidence),
            match_type = CASE WHEN excluded.confidence > confidence THEN excluded.match_type ELSE match_type END",
        params![group_id, item_id, confidence, match_type],
    )?;
    Ok(())
}

/// Move all members of `from` into `to`.
pub fn move_group_members(conn: &Connection, from: i64, to: i64) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE duplicate_group_members SET group_id = ?2, is_best = 0 WHERE group_id = ?1",
        params![from, to],
    )?;
    Ok(rows)
}

pub fn delete_group(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM duplicate_groups WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn remove_group_member(conn: &Connection, group_id: i64, item_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM duplicate_group_members WHERE group_id = ?1 AND item_id = ?2",
        params![group_id, item_id],
    )?;
    Ok(rows > 0)
}

/// Every group (any status) that lists `item_id`.
pub fn groups_for_item(conn: &Connection, item_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT group_id FROM duplicate_group_members WHERE item_id = ?1 ORDER BY group_id",
    )?;
    let ids = stmt
        .query_map(params![item_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Set scene_count, best item and the matching is_best flags.
pub fn set_group_summary(conn: &Connection, group_id: i64, scene_count: i64, best_item_id: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE duplicate_groups SET scene_count = ?1, best_item_id = ?2, updated_at = datetime('now')
         WHERE id = ?3",
        params![scene_count, best_item_id, group_id],
    )?;
    conn.execute(
        "UPDATE duplicate_group_members SET is_best = (item_id IS ?1) WHERE group_id = ?2",
        params![best_item_id, group_id],
    )?;
    Ok(())
}

/// Close a group as resolved or dismissed. Members leave the open set.
pub fn close_group(conn: &Connection, group_id: i64, status: &str) -> Result<()> {
    conn.execute(
        "UPDATE duplicate_groups SET status = ?1, resolved_at = datetime('now'), updated_at = datetime('now')
         WHERE id = ?2",
        params![status, group_id],
    )?;
    conn.execute(
        "UPDATE duplicate_group_members SET is_open = 0 WHERE group_id = ?1",
        params![group_id],
    )?;
    Ok(())
}
