// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;
use anyhow::Result;

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Items, processing queue, history, trigger/retry config
    r#"
    -- Media items (scenes)
    CREATE TABLE items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        duration_secs REAL NOT NULL DEFAULT 0,
        width INTEGER,
        height INTEGER,
        frame_rate REAL,
        bit_rate INTEGER,
        video_codec TEXT,
        audio_codec TEXT,
        processing_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (processing_status IN ('pending', 'processing', 'completed', 'failed')),
        metadata_done INTEGER NOT NULL DEFAULT 0,
        thumbnail_done INTEGER NOT NULL DEFAULT 0,
        sprites_done INTEGER NOT NULL DEFAULT 0,
        fingerprint_done INTEGER NOT NULL DEFAULT 0,
        thumbnail_path TEXT,
        sprite_vtt_path TEXT,
        audio_fingerprint BLOB,
        visual_fingerprint BLOB,
        fingerprint_type TEXT CHECK (fingerprint_type IN ('audio', 'visual', 'dual')),
        fingerprinted_at TEXT,
        trashed_at TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Tags and actors (merged onto the kept variant when resolving duplicates)
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE item_tags (
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        PRIMARY KEY (item_id, tag_id)
    );

    CREATE TABLE actors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );

    CREATE TABLE item_actors (
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        actor_id INTEGER NOT NULL REFERENCES actors(id),
        PRIMARY KEY (item_id, actor_id)
    );

    -- Durable pending/running work. One row per (item, phase) is the
    -- admission idempotence guarantee.
    CREATE TABLE job_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        phase TEXT NOT NULL CHECK (phase IN ('metadata', 'thumbnail', 'sprites', 'fingerprint')),
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'running')),
        priority INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        not_before TEXT NOT NULL DEFAULT (datetime('now')),
        job_id TEXT,
        claimed_by TEXT,
        run_token TEXT,
        lease_expires_at TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        started_at TEXT,
        UNIQUE (item_id, phase)
    );

    -- Terminal outcome of every job attempt
    CREATE TABLE job_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        item_id INTEGER NOT NULL,
        phase TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('succeeded', 'failed', 'cancelled', 'timed_out')),
        attempt INTEGER NOT NULL DEFAULT 0,
        error_kind TEXT,
        error_message TEXT,
        started_at TEXT,
        finished_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE trigger_config (
        phase TEXT PRIMARY KEY NOT NULL,
        trigger_type TEXT NOT NULL CHECK (trigger_type IN ('on_import', 'after_job', 'scheduled', 'manual')),
        after_phase TEXT,
        cron_expr TEXT,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE retry_config (
        phase TEXT PRIMARY KEY NOT NULL,
        max_retries INTEGER NOT NULL,
        initial_delay_secs INTEGER NOT NULL,
        max_delay_secs INTEGER NOT NULL,
        backoff_factor REAL NOT NULL
    );

    CREATE TABLE dead_letter_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        phase TEXT NOT NULL,
        error_kind TEXT NOT NULL,
        error_message TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'retried', 'abandoned')),
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        resolved_at TEXT
    );

    CREATE INDEX idx_items_status ON items(processing_status);
    CREATE INDEX idx_job_queue_claim ON job_queue(phase, status, not_before);
    CREATE INDEX idx_job_history_item ON job_history(item_id);
    CREATE INDEX idx_job_history_finished ON job_history(finished_at);
    CREATE INDEX idx_dlq_status ON dead_letter_queue(status);
    "#,

    // Migration 2: Duplicate detection
    r#"
    -- Singleton row of runtime-tunable thresholds
    CREATE TABLE duplication_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        enabled INTEGER NOT NULL DEFAULT 1,
        fingerprint_mode TEXT NOT NULL DEFAULT 'audio_only'
            CHECK (fingerprint_mode IN ('audio_only', 'dual')),
        audio_density_threshold REAL NOT NULL,
        audio_min_hashes INTEGER NOT NULL,
        audio_min_span INTEGER NOT NULL,
        audio_delta_tolerance INTEGER NOT NULL,
        audio_max_scene_freq INTEGER NOT NULL,
        visual_density_threshold REAL NOT NULL,
        visual_min_frames INTEGER NOT NULL,
        visual_min_span INTEGER NOT NULL,
        visual_delta_tolerance INTEGER NOT NULL,
        visual_hamming_max INTEGER NOT NULL,
        codec_bonus TEXT NOT NULL DEFAULT '{}',
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE duplicate_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        status TEXT NOT NULL DEFAULT 'unresolved'
            CHECK (status IN ('unresolved', 'resolved', 'dismissed')),
        scene_count INTEGER NOT NULL DEFAULT 0,
        best_item_id INTEGER REFERENCES items(id) ON DELETE SET NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        resolved_at TEXT
    );

    CREATE TABLE duplicate_group_members (
        group_id INTEGER NOT NULL REFERENCES duplicate_groups(id) ON DELETE CASCADE,
        item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
        is_best INTEGER NOT NULL DEFAULT 0,
        confidence REAL NOT NULL DEFAULT 0,
        match_type TEXT NOT NULL CHECK (match_type IN ('audio', 'visual')),
        is_open INTEGER NOT NULL DEFAULT 1,
        added_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (group_id, item_id)
    );

    -- An item belongs to at most one unresolved group
    CREATE UNIQUE INDEX ux_group_members_open_item
        ON duplicate_group_members(item_id) WHERE is_open = 1;
    CREATE INDEX idx_group_members_item ON duplicate_group_members(item_id);
    CREATE INDEX idx_groups_status ON duplicate_groups(status);
    "#,

    // Migration 3: Admin requests picked up by a running pipeline
    r#"
    ALTER TABLE job_queue ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0;

    -- Worker counts set at runtime, overriding the config file
    CREATE TABLE pool_workers (
        phase TEXT PRIMARY KEY CHECK (phase IN ('metadata', 'thumbnail', 'sprites', 'fingerprint')),
        workers INTEGER NOT NULL CHECK (workers > 0),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    "#,
];

/// Get current schema version from database
fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "PRAGMA user_version",
        [],
        |row| row.get(0)
    )?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade vidsift.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}
