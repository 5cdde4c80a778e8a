// Processing pipeline
//
// Wires the database, per-phase pools, feeders, result handling and the
// cron scheduler together, and exposes the admin operations.

pub mod cron;
pub mod events;
pub mod feeder;
pub mod import;
pub mod results;
pub mod scheduler;
pub mod triggers;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::db::schema;
use crate::db::Db;
use crate::duplicates::{self, DuplicateService, GroupDetail};
use crate::error::{Result, SiftError};
use crate::index::{FingerprintIndex, SqliteFingerprintIndex};
use crate::jobs::pool::{OutputHandler, PhasePool};
use crate::jobs::{CancelRegistry, JobReport, Phase, QueuedJob};
use crate::tools;

use events::EventSink;
use feeder::{FeederHandle, JobQueueFeeder};
use import::ImportedItem;
use results::ResultHandler;
use scheduler::{Scheduler, SchedulerHandle};
use triggers::{Admission, PhaseTracker};

pub const DLQ_RETRIED: &str = "retried";
pub const DLQ_ABANDONED: &str = "abandoned";

/// Open the fingerprint index, or run without matching if it is unusable.
fn open_index(config: &PipelineConfig) -> Option<Arc<dyn FingerprintIndex>> {
    if !config.index_enabled {
        log::info!("Fingerprint index disabled; duplicate matching is off");
        return None;
    }
    let index = match SqliteFingerprintIndex::open(&config.index_db_path()) {
        Ok(index) => index,
        Err(e) => {
            log::warn!("Fingerprint index unavailable, matching disabled: {}", e);
            return None;
        }
    };
    if let Err(e) = index.health() {
        log::warn!("Fingerprint index failed health check, matching disabled: {}", e);
        return None;
    }
    Some(Arc::new(index))
}

struct Running {
    pools: BTreeMap<Phase, Arc<PhasePool<QueuedJob>>>,
    feeders: Vec<FeederHandle>,
    scheduler: SchedulerHandle,
}

pub struct Pipeline {
    db: Db,
    config: Arc<PipelineConfig>,
    tracker: Arc<PhaseTracker>,
    registry: Arc<CancelRegistry>,
    results: Arc<ResultHandler>,
    duplicates: Option<Arc<DuplicateService>>,
    worker_id: String,
    running: Option<Running>,
}

impl Pipeline {
    /// Open the databases under `config.data_dir`. Nothing runs until `start`.
    pub fn open(config: PipelineConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Db::open(&config.db_path())?;
        let index = open_index(&config);
        Ok(Self::with_parts(db, config, index, events))
    }

    /// Assemble a pipeline over an existing database and index.
    pub fn with_parts(
        db: Db,
        config: PipelineConfig,
        index: Option<Arc<dyn FingerprintIndex>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let registry = Arc::new(CancelRegistry::new());
        let duplicates = index.map(|index| Arc::new(DuplicateService::new(db.clone(), index)));
        let results = Arc::new(ResultHandler::new(
            db.clone(),
            Arc::clone(&registry),
            duplicates.clone(),
            events,
        ));
        Self {
            tracker: Arc::new(PhaseTracker::new(db.clone())),
            db,
            config: Arc::new(config),
            registry,
            results,
            duplicates,
            worker_id: feeder::worker_id(),
            running: None,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start pools, feeders and the scheduler.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(SiftError::Invalid("pipeline is already running".to_string()));
        }
        // Rows left running by an earlier run of this process id
        let released = self.db.with(|conn| schema::release_claims_by(conn, &self.worker_id))?;
        if released > 0 {
            log::warn!("Released {} stale claim(s) held by {}", released, self.worker_id);
        }

        let missing = tools::missing_tools();
        if !missing.is_empty() {
            log::warn!("Tools not found: {}; phases that need them will fail", missing.join(", "));
        }

        let mut pools = BTreeMap::new();
        for phase in Phase::ALL {
            let results = Arc::clone(&self.results);
            let handler: OutputHandler<JobReport> = Arc::new(move |report| results.handle(report));
            let workers = self
                .db
                .with(|conn| schema::get_pool_workers(conn, phase))?
                .unwrap_or_else(|| self.config.workers.for_phase(phase));
            let pool = PhasePool::start(
                phase.as_str(),
                workers,
                self.config.queue_capacity,
                handler,
            )?;
            pools.insert(phase, Arc::new(pool));
        }

        let interval = Duration::from_millis(self.config.poll_interval_ms.max(10));
        let mut feeders = Vec::with_capacity(pools.len());
        for (phase, pool) in &pools {
            let feeder = Arc::new(JobQueueFeeder::new(
                self.db.clone(),
                *phase,
                Arc::clone(pool),
                Arc::clone(&self.registry),
                Arc::clone(&self.results),
                Arc::clone(&self.config),
                self.worker_id.clone(),
            ));
            feeders.push(feeder.spawn(interval)?);
        }

        let scheduler = Scheduler::new(
            self.db.clone(),
            Arc::clone(&self.tracker),
            self.config.scheduled_batch_size,
            self.config.history_retention_days,
        )
        .spawn(Duration::from_secs(self.config.scheduler_tick_secs.max(1)))?;

        self.running = Some(Running { pools, feeders, scheduler });
        log::info!("Pipeline started as {}", self.worker_id);
        Ok(())
    }

    /// Feeders first, then pools (interrupting what is still running at the
    /// deadline), then the scheduler. Returns true if every pool drained in time.
    pub fn shutdown(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return true;
        };
        log::info!("Pipeline shutting down");
        for feeder in running.feeders {
            feeder.stop();
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.shutdown_timeout_secs);
        let mut drained = true;
        for pool in running.pools.values() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let registry = Arc::clone(&self.registry);
            drained &= pool.stop_within(Some(remaining), move || registry.interrupt_all());
        }

        running.scheduler.stop();
        log::info!("Pipeline stopped (drained: {})", drained);
        drained
    }

    /// Register a file, or every video under a directory, and queue the
    /// on-import phases for new items. Files that fail are logged and skipped.
    pub fn import(&self, source: &Path) -> Result<Vec<ImportedItem>> {
        let files = import::discover_videos(source)?;
        let mut imported = Vec::with_capacity(files.len());
        for file in files {
            match self.db.with(|conn| import::register_item(conn, &file)) {
                Ok(item) => {
                    if item.created {
                        self.tracker.on_import(item.item_id)?;
                    }
                    imported.push(item);
                }
                Err(e) => log::warn!("Skipping {}: {}", file.display(), e),
            }
        }
        Ok(imported)
    }

    /// Cancel a running job. Jobs run by this pipeline are cancelled at once;
    /// jobs held by another process on the same database are flagged for its
    /// feeder. Returns false if no such job is running.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        if self.registry.cancel(job_id) {
            log::info!("Cancel requested for job {}", job_id);
            return Ok(true);
        }
        let flagged = self.db.with(|conn| schema::request_cancel(conn, job_id))?;
        if flagged {
            log::info!("Cancel flagged for job {}", job_id);
        }
        Ok(flagged)
    }

    /// Change a phase's worker count without stopping the pipeline. The count
    /// is stored, so later runs and other running processes pick it up too.
    pub fn resize(&self, phase: Phase, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(SiftError::Invalid("worker count must be at least 1".to_string()));
        }
        self.db.with(|conn| schema::set_pool_workers(conn, phase, workers))?;
        if let Some(pool) = self.running.as_ref().and_then(|r| r.pools.get(&phase)) {
            pool.resize(workers)?;
        }
        Ok(())
    }

    /// Clear the phase flag and queue the phase again.
    pub fn reprocess(&self, item_id: i64, phase: Phase) -> Result<Admission> {
        self.db.with(|conn| {
            if schema::get_item(conn, item_id)?.is_none() {
                return Err(SiftError::NotFound(format!("item {}", item_id)));
            }
            schema::set_phase_done(conn, item_id, phase, false)
        })?;
        self.tracker.request(item_id, phase)
    }

    /// Manual trigger: queue a phase for an item if it is eligible.
    pub fn request(&self, item_id: i64, phase: Phase) -> Result<Admission> {
        self.tracker.request(item_id, phase)
    }

    /// Move a pending dead letter back onto the queue with a fresh budget.
    pub fn retry_dead_letter(&self, entry_id: i64) -> Result<Admission> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let entry = schema::get_dead_letter(&tx, entry_id)?
                .ok_or_else(|| SiftError::NotFound(format!("dead letter {}", entry_id)))?;
            if !schema::resolve_dead_letter(&tx, entry_id, DLQ_RETRIED)? {
                return Err(SiftError::Invalid(format!("dead letter {} is already {}", entry_id, entry.status)));
            }
            let phase = Phase::parse(&entry.phase)?;
            let admission = triggers::enqueue_phase(&tx, entry.item_id, phase)?;
            schema::refresh_processing_status(&tx, entry.item_id)?;
            tx.commit()?;
            log::info!("Dead letter {} requeued ({} for item {})", entry_id, phase, entry.item_id);
            Ok(admission)
        })
    }

    pub fn abandon_dead_letter(&self, entry_id: i64) -> Result<()> {
        self.db.with(|conn| {
            let entry = schema::get_dead_letter(conn, entry_id)?
                .ok_or_else(|| SiftError::NotFound(format!("dead letter {}", entry_id)))?;
            if !schema::resolve_dead_letter(conn, entry_id, DLQ_ABANDONED)? {
                return Err(SiftError::Invalid(format!("dead letter {} is already {}", entry_id, entry.status)));
            }
            schema::refresh_processing_status(conn, entry.item_id)?;
            log::info!("Dead letter {} abandoned", entry_id);
            Ok(())
        })
    }

    fn duplicate_service(&self) -> Result<&DuplicateService> {
        self.duplicates
            .as_deref()
            .ok_or_else(|| SiftError::Invalid("fingerprint index is not available".to_string()))
    }

    pub fn list_groups(&self, status: Option<&str>, limit: i64) -> Result<Vec<GroupDetail>> {
        self.duplicate_service()?.list_groups(status, limit)
    }

    pub fn resolve_group(&self, group_id: i64, best_item_id: i64, merge_metadata: bool) -> Result<()> {
        self.duplicate_service()?.resolve_group(group_id, best_item_id, merge_metadata)
    }

    pub fn dismiss_group(&self, group_id: i64) -> Result<()> {
        self.duplicate_service()?.dismiss_group(group_id)
    }

    /// Permanently delete an item and everything derived from it.
    pub fn delete_item(&self, item_id: i64) -> Result<bool> {
        if let Some(service) = &self.duplicates {
            return service.delete_item(item_id);
        }
        self.db.with(|conn| {
            let config = schema::get_duplication_config(conn)?;
            let tx = conn.transaction()?;
            duplicates::detach_item_from_groups(&tx, item_id, &config.codec_bonus)?;
            schema::delete_queue_rows_for_item(&tx, item_id)?;
            let deleted = schema::delete_item_row(&tx, item_id)?;
            tx.commit()?;
            Ok(deleted)
        })
    }

    /// Wait until no due rows are queued and no job is in flight.
    /// Returns false if `timeout` passed first.
    pub fn run_until_idle(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let poll = Duration::from_millis(self.config.poll_interval_ms.clamp(10, 250));
        loop {
            let due = self.db.with(|conn| schema::count_queue(conn, true))?;
            let in_flight: usize = self
                .running
                .as_ref()
                .map(|r| r.pools.values().map(|p| p.in_flight()).sum())
                .unwrap_or(0);
            if due == 0 && in_flight == 0 {
                return Ok(true);
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                log::warn!("Pipeline not idle after {:?}: {} due, {} in flight", timeout, due, in_flight);
                return Ok(false);
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.running.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::NewItem;
    use crate::jobs::metadata::MediaProbe;
    use events::LogEventSink;
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir) -> Pipeline {
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            poll_interval_ms: 20,
            shutdown_timeout_secs: 5,
            ..PipelineConfig::default()
        };
        let db = Db::open_in_memory().unwrap();
        let index: Arc<dyn FingerprintIndex> = Arc::new(SqliteFingerprintIndex::open_in_memory().unwrap());
        Pipeline::with_parts(db, config, Some(index), Arc::new(LogEventSink))
    }

    fn add_item(p: &Pipeline, path: &str) -> i64 {
        p.db()
            .with(|conn| schema::insert_item(conn, &NewItem { path: path.into(), title: path.into(), size_bytes: 1 }))
            .unwrap()
    }

    fn probe(duration: f64) -> MediaProbe {
        MediaProbe {
            duration_secs: duration,
            width: Some(1280),
            height: Some(720),
            frame_rate: Some(30.0),
            bit_rate: Some(2_000_000),
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
        }
    }

    #[test]
    fn test_import_queues_on_import_phases() {
        let dir = TempDir::new().unwrap();
        let media = TempDir::new().unwrap();
        std::fs::write(media.path().join("a.mp4"), b"x").unwrap();
        std::fs::write(media.path().join("b.txt"), b"x").unwrap();
        let p = pipeline(&dir);

        let imported = p.import(media.path()).unwrap();
        assert_eq!(imported.len(), 1);
        let queue = p.db().with(|conn| schema::list_queue(conn, 10)).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].phase, "metadata");

        // Second import finds the same item and queues nothing new
        let again = p.import(media.path()).unwrap();
        assert!(!again[0].created);
        assert_eq!(p.db().with(|conn| schema::count_queue(conn, false)).unwrap(), 1);
    }

    #[test]
    fn test_reprocess_requires_metadata() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        let id = add_item(&p, "/v/a.mp4");

        let err = p.reprocess(id, Phase::Thumbnail).unwrap_err();
        assert!(matches!(err, SiftError::PrerequisiteNotMet(_)));
        assert!(matches!(p.reprocess(999, Phase::Metadata), Err(SiftError::NotFound(_))));

        p.db()
            .with(|conn| {
                schema::update_item_metadata(conn, id, &probe(60.0))?;
                schema::set_phase_done(conn, id, Phase::Metadata, true)?;
                schema::set_phase_done(conn, id, Phase::Thumbnail, true)
            })
            .unwrap();
        assert_eq!(p.reprocess(id, Phase::Thumbnail).unwrap(), Admission::Queued);
        let item = p.db().with(|conn| schema::get_item(conn, id)).unwrap().unwrap();
        assert!(!item.thumbnail_done);
        assert_eq!(p.reprocess(id, Phase::Thumbnail).unwrap(), Admission::AlreadyQueued);
    }

    #[test]
    fn test_dead_letter_retry_and_abandon() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        let id = add_item(&p, "/v/a.mp4");
        let (retry_id, abandon_id) = p
            .db()
            .with(|conn| {
                let a = schema::insert_dead_letter(conn, id, Phase::Metadata, "probe_error", "bad", 4)?;
                let b = schema::insert_dead_letter(conn, id, Phase::Metadata, "probe_error", "bad", 4)?;
                Ok((a, b))
            })
            .unwrap();

        assert_eq!(p.retry_dead_letter(retry_id).unwrap(), Admission::Queued);
        assert!(matches!(p.retry_dead_letter(retry_id), Err(SiftError::Invalid(_))));
        // One pending entry remains, so the item still reads as failed
        let item = p.db().with(|conn| schema::get_item(conn, id)).unwrap().unwrap();
        assert_eq!(item.processing_status, "failed");

        p.abandon_dead_letter(abandon_id).unwrap();
        let item = p.db().with(|conn| schema::get_item(conn, id)).unwrap().unwrap();
        assert_eq!(item.processing_status, "pending");
        assert!(matches!(p.abandon_dead_letter(777), Err(SiftError::NotFound(_))));
    }

    #[test]
    fn test_resize_is_stored_for_next_start() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        assert!(p.resize(Phase::Metadata, 0).is_err());
        p.resize(Phase::Metadata, 3).unwrap();
        assert!(!p.cancel_job("nope").unwrap());

        p.start().unwrap();
        let pools = &p.running.as_ref().unwrap().pools;
        assert_eq!(pools[&Phase::Metadata].worker_count(), 3);
        assert!(p.shutdown());
    }

    #[test]
    fn test_start_run_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut p = pipeline(&dir);
        // Missing files fail fast whatever tools are installed
        let ids: Vec<i64> = (0..4).map(|i| add_item(&p, &format!("/missing/{}.mp4", i))).collect();
        p.db()
            .with(|conn| {
                schema::upsert_retry_config(
                    conn,
                    &schema::RetryConfig { max_retries: 0, ..schema::RetryConfig::default_for(Phase::Metadata) },
                )?;
                for id in &ids {
                    schema::enqueue_job(conn, *id, Phase::Metadata, Phase::Metadata.priority())?;
                }
                Ok(())
            })
            .unwrap();

        p.start().unwrap();
        assert!(p.start().is_err());
        p.resize(Phase::Metadata, 1).unwrap();
        assert!(p.run_until_idle(Duration::from_secs(20)).unwrap());
        assert!(p.shutdown());
        assert!(!p.is_running());

        let history = p.db().with(|conn| schema::count_job_history(conn)).unwrap();
        assert_eq!(history, 4);
        assert_eq!(p.db().with(|conn| schema::count_queue(conn, false)).unwrap(), 0);
    }

    #[test]
    fn test_delete_item_removes_queue_rows() {
        let dir = TempDir::new().unwrap();
        let p = pipeline(&dir);
        let id = add_item(&p, "/v/a.mp4");
        p.tracker().request(id, Phase::Metadata).unwrap();

        assert!(p.delete_item(id).unwrap());
        assert!(!p.delete_item(id).unwrap());
        assert_eq!(p.db().with(|conn| schema::count_queue(conn, false)).unwrap(), 0);
    }
}
