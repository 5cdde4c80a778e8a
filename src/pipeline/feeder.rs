// Job queue feeder
//
// One feeder per phase. Each tick claims due rows from job_queue, up to the
// pool's free worker slots, and submits them. Claims are UPDATE ... RETURNING
// on the shared connection, so two feeders never get the same row.
//
// Admin requests written to the database by another process (job cancels,
// worker counts) are applied at the start of each tick.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::schema::{self, DuplicationConfig, Item};
use crate::db::Db;
use crate::error::{Result, SiftError};
use crate::jobs::fingerprint::FingerprintJob;
use crate::jobs::metadata::MetadataJob;
use crate::jobs::pool::PhasePool;
use crate::jobs::sprites::SpritesJob;
use crate::jobs::thumbnail::ThumbnailJob;
use crate::jobs::{CancelRegistry, JobReport, JobTicket, MediaJob, Phase, QueuedJob};

use super::results::ResultHandler;

/// Identifier stamped on claimed rows: host and process.
pub fn worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", hostname, std::process::id())
}

/// Build the job for a claimed row from the item's current state.
pub fn build_job(item: &Item, phase: Phase, config: &PipelineConfig, duplication: &DuplicationConfig) -> MediaJob {
    let path = PathBuf::from(&item.path);
    match phase {
        Phase::Metadata => MediaJob::Metadata(MetadataJob::new(item.id, path)),
        Phase::Thumbnail => MediaJob::Thumbnail(ThumbnailJob {
            item_id: item.id,
            path,
            duration_secs: item.duration_secs,
            output_dir: config.thumbs_dir(),
            options: config.thumbnail.clone(),
        }),
        Phase::Sprites => MediaJob::Sprites(SpritesJob {
            item_id: item.id,
            path,
            duration_secs: item.duration_secs,
            width: item.width,
            height: item.height,
            output_dir: config.sprites_dir(),
            options: config.sprites.clone(),
        }),
        Phase::Fingerprint => MediaJob::Fingerprint(FingerprintJob {
            item_id: item.id,
            path,
            has_audio: item.has_audio(),
            mode: duplication.fingerprint_mode,
        }),
    }
}

pub struct JobQueueFeeder {
    db: Db,
    phase: Phase,
    pool: Arc<PhasePool<QueuedJob>>,
    registry: Arc<CancelRegistry>,
    results: Arc<ResultHandler>,
    config: Arc<PipelineConfig>,
    worker_id: String,
}

impl JobQueueFeeder {
    pub fn new(
        db: Db,
        phase: Phase,
        pool: Arc<PhasePool<QueuedJob>>,
        registry: Arc<CancelRegistry>,
        results: Arc<ResultHandler>,
        config: Arc<PipelineConfig>,
        worker_id: String,
    ) -> Self {
        Self { db, phase, pool, registry, results, config, worker_id }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Cancel flagged jobs this process holds and apply a changed worker count.
    pub fn apply_requests(&self) -> Result<()> {
        let (cancels, workers) = self.db.with(|conn| {
            Ok((
                schema::cancel_requests(conn, &self.worker_id, self.phase)?,
                schema::get_pool_workers(conn, self.phase)?,
            ))
        })?;
        for job_id in cancels {
            if self.registry.cancel(&job_id) {
                log::debug!("Cancel flag set for {} job {}", self.phase, job_id);
            }
        }
        if let Some(workers) = workers {
            if workers != self.pool.worker_count() {
                self.pool.resize(workers)?;
            }
        }
        Ok(())
    }

    /// Claim and submit as many due rows as the pool has free workers.
    /// Returns the number submitted.
    pub fn tick(&self) -> Result<usize> {
        self.apply_requests()?;

        let reclaimed = self.db.with(|conn| schema::reclaim_expired_claims(conn))?;
        if reclaimed > 0 {
            log::warn!("Reclaimed {} job(s) with expired leases", reclaimed);
        }

        let mut capacity = self.pool.available();
        let mut submitted = 0;
        while capacity > 0 {
            let job_id = Uuid::new_v4().to_string();
            let run_token = Uuid::new_v4().to_string();

            let claimed = self.db.with(|conn| {
                if self.phase == Phase::Fingerprint && !schema::get_duplication_config(conn)?.enabled {
                    return Ok(None);
                }
                let Some(row) = schema::claim_next(
                    conn,
                    self.phase,
                    &self.worker_id,
                    &job_id,
                    &run_token,
                    self.config.claim_lease_secs,
                )?
                else {
                    return Ok(None);
                };
                schema::refresh_processing_status(conn, row.item_id)?;
                let item = schema::get_item(conn, row.item_id)?;
                let duplication = schema::get_duplication_config(conn)?;
                Ok(Some((row, item, duplication)))
            })?;
            let Some((row, item, duplication)) = claimed else {
                break;
            };
            capacity -= 1;

            let ticket = JobTicket {
                job_id,
                queue_id: row.id,
                item_id: row.item_id,
                phase: self.phase,
                attempt: row.attempts,
                run_token,
            };
            let Some(item) = item else {
                self.results.handle(JobReport {
                    ticket,
                    started_at: None,
                    finished_at: Utc::now(),
                    outcome: Err(SiftError::NotFound(format!("item {}", row.item_id))),
                });
                continue;
            };

            let job = build_job(&item, self.phase, &self.config, &duplication);
            let cancel = self.registry.register(&ticket.job_id);
            let queued = QueuedJob {
                ticket: ticket.clone(),
                job,
                cancel,
                timeout_secs: self.config.timeouts.for_phase(self.phase),
            };
            if let Err(e) = self.pool.submit(queued) {
                self.registry.remove(&ticket.job_id);
                self.db.with(|conn| {
                    schema::release_claim(conn, ticket.queue_id, &ticket.run_token)?;
                    schema::refresh_processing_status(conn, ticket.item_id)
                })?;
                log::warn!("Could not submit {} job for item {}: {}", self.phase, ticket.item_id, e);
                break;
            }
            log::debug!("Submitted {} job {} for item {}", self.phase, ticket.job_id, ticket.item_id);
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Run `tick` on a background thread every `interval` until stopped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<FeederHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let name = format!("feeder-{}", self.phase);
        let handle = thread::Builder::new().name(name).spawn(move || loop {
            if let Err(e) = self.tick() {
                log::error!("Feeder for {} failed: {}", self.phase, e);
            }
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        Ok(FeederHandle { stop_tx, handle })
    }
}

pub struct FeederHandle {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl FeederHandle {
    /// Stop claiming. Jobs already submitted keep running in their pool.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("Feeder thread panicked");
        }
    }
}
