// Result handling for finished jobs
//
// Runs on each pool's dispatcher thread. Every report ends in exactly one
// job_history row; the queue row is completed, requeued with backoff,
// released, or moved to the dead-letter queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::db::schema::{self, NewJobHistory};
use crate::db::Db;
use crate::duplicates::DuplicateService;
use crate::error::{Result, SiftError};
use crate::jobs::{CancelRegistry, JobOutput, JobReport, JobTicket};

use super::events::{EventSink, PipelineEvent};
use super::triggers;

pub const HISTORY_SUCCEEDED: &str = "succeeded";
pub const HISTORY_FAILED: &str = "failed";
pub const HISTORY_CANCELLED: &str = "cancelled";
pub const HISTORY_TIMED_OUT: &str = "timed_out";

/// What the handler did with a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retrying { delay_secs: i64 },
    DeadLettered,
    Cancelled,
    /// Claim released for a later run (shutdown)
    Released,
    Failed,
    /// The queue row is no longer held by this run (lease expired and reclaimed)
    Stale,
}

fn sql_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn holds_claim(conn: &Connection, ticket: &JobTicket) -> Result<bool> {
    Ok(schema::get_queue_row(conn, ticket.queue_id)?
        .map(|row| row.run_token.as_deref() == Some(ticket.run_token.as_str()))
        .unwrap_or(false))
}

fn persist_output(conn: &Connection, item_id: i64, output: &JobOutput) -> Result<()> {
    match output {
        JobOutput::Metadata(probe) => schema::update_item_metadata(conn, item_id, probe),
        JobOutput::Thumbnail(thumb) => {
            schema::update_item_thumbnail(conn, item_id, &thumb.large_path.to_string_lossy())
        }
        JobOutput::Sprites(sprites) => {
            schema::update_item_sprites(conn, item_id, &sprites.vtt_path.to_string_lossy())
        }
        JobOutput::Fingerprint(fp) => schema::store_fingerprints(conn, item_id, fp),
    }
}

pub struct ResultHandler {
    db: Db,
    registry: Arc<CancelRegistry>,
    /// Absent when the fingerprint index is disabled or unavailable
    duplicates: Option<Arc<DuplicateService>>,
    events: Arc<dyn EventSink>,
}

impl ResultHandler {
    pub fn new(
        db: Db,
        registry: Arc<CancelRegistry>,
        duplicates: Option<Arc<DuplicateService>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { db, registry, duplicates, events }
    }

    /// Dispatcher entry point. Never panics on a bad report.
    pub fn handle(&self, report: JobReport) {
        let job_id = report.ticket.job_id.clone();
        self.registry.remove(&job_id);
        if let Err(e) = self.process(report) {
            log::error!("Failed to record result of job {}: {}", job_id, e);
        }
    }

    pub fn process(&self, report: JobReport) -> Result<Disposition> {
        let JobReport { ticket, started_at, finished_at, outcome } = report;
        let history = NewJobHistory {
            job_id: ticket.job_id.clone(),
            item_id: ticket.item_id,
            phase: ticket.phase,
            status: HISTORY_SUCCEEDED,
            attempt: ticket.attempt,
            error_kind: None,
            error_message: None,
            started_at: started_at.map(sql_time),
            finished_at: sql_time(finished_at),
        };

        match outcome {
            Ok(output) => self.on_success(&ticket, history, output),
            Err(err) => self.on_failure(&ticket, history, err),
        }
    }

    fn on_success(&self, ticket: &JobTicket, history: NewJobHistory, output: JobOutput) -> Result<Disposition> {
        // Matching runs while the claim is still held, so a failure goes
        // through the retry path and the next attempt redoes it from scratch.
        let mut group = None;
        if let (JobOutput::Fingerprint(fp), Some(duplicates)) = (&output, &self.duplicates) {
            if self.db.with(|conn| holds_claim(conn, ticket))? {
                match duplicates.process_item_fingerprints(ticket.item_id, fp.audio.as_deref(), fp.visual.as_deref()) {
                    Ok(touched) => group = touched,
                    Err(e) => {
                        log::error!("Duplicate matching failed for item {}: {}", ticket.item_id, e);
                        return self.on_failure(ticket, history, e);
                    }
                }
            }
        }

        let committed = self.db.with(|conn| {
            let tx = conn.transaction()?;
            schema::insert_job_history(&tx, &history)?;
            if !holds_claim(&tx, ticket)? {
                tx.commit()?;
                return Ok(false);
            }
            persist_output(&tx, ticket.item_id, &output)?;
            schema::set_phase_done(&tx, ticket.item_id, ticket.phase, true)?;
            schema::complete_queue_row(&tx, ticket.queue_id, &ticket.run_token)?;
            let queued = triggers::schedule_dependents(&tx, ticket.item_id, ticket.phase)?;
            schema::refresh_processing_status(&tx, ticket.item_id)?;
            tx.commit()?;
            if !queued.is_empty() {
                log::debug!("Item {}: {} done, queued {:?}", ticket.item_id, ticket.phase, queued);
            }
            Ok(true)
        })?;

        if !committed {
            log::warn!(
                "Job {} finished after its claim on queue row {} was lost, result dropped",
                ticket.job_id,
                ticket.queue_id
            );
            return Ok(Disposition::Stale);
        }
        log::debug!("Job {} ({} for item {}) succeeded", ticket.job_id, ticket.phase, ticket.item_id);

        let mut event = PipelineEvent::completed(ticket.item_id, ticket.phase);
        if let JobOutput::Fingerprint(fp) = &output {
            event = event.with_detail(fp.fingerprint_type.as_str());
        }
        if let Some(group_id) = group {
            self.events.publish(PipelineEvent::DuplicateGroupUpdated { group_id, item_id: ticket.item_id });
        }
        self.events.publish(event);
        Ok(Disposition::Completed)
    }

    fn on_failure(&self, ticket: &JobTicket, mut history: NewJobHistory, err: SiftError) -> Result<Disposition> {
        let message = err.to_string();
        history.error_kind = Some(err.kind());
        history.error_message = Some(message.clone());
        history.status = match err {
            SiftError::Cancelled(_) | SiftError::Interrupted => HISTORY_CANCELLED,
            SiftError::Timeout(_) => HISTORY_TIMED_OUT,
            _ => HISTORY_FAILED,
        };

        let disposition = self.db.with(|conn| {
            let tx = conn.transaction()?;
            schema::insert_job_history(&tx, &history)?;
            if !holds_claim(&tx, ticket)? {
                tx.commit()?;
                return Ok(Disposition::Stale);
            }

            let disposition = match &err {
                SiftError::Interrupted => {
                    schema::release_claim(&tx, ticket.queue_id, &ticket.run_token)?;
                    Disposition::Released
                }
                SiftError::Cancelled(_) => {
                    schema::complete_queue_row(&tx, ticket.queue_id, &ticket.run_token)?;
                    Disposition::Cancelled
                }
                e if e.is_retryable() => {
                    let retry = schema::get_retry_config(&tx, ticket.phase)?;
                    if ticket.attempt < retry.max_retries {
                        let delay_secs = retry.backoff_secs(ticket.attempt);
                        schema::requeue_with_backoff(
                            &tx,
                            ticket.queue_id,
                            &ticket.run_token,
                            ticket.attempt + 1,
                            &message,
                            delay_secs,
                        )?;
                        Disposition::Retrying { delay_secs }
                    } else {
                        schema::insert_dead_letter(
                            &tx,
                            ticket.item_id,
                            ticket.phase,
                            e.kind(),
                            &message,
                            ticket.attempt + 1,
                        )?;
                        schema::complete_queue_row(&tx, ticket.queue_id, &ticket.run_token)?;
                        Disposition::DeadLettered
                    }
                }
                SiftError::ToolNotFound(_) => {
                    schema::insert_dead_letter(&tx, ticket.item_id, ticket.phase, err.kind(), &message, ticket.attempt + 1)?;
                    schema::complete_queue_row(&tx, ticket.queue_id, &ticket.run_token)?;
                    Disposition::DeadLettered
                }
                _ => {
                    schema::complete_queue_row(&tx, ticket.queue_id, &ticket.run_token)?;
                    Disposition::Failed
                }
            };
            schema::refresh_processing_status(&tx, ticket.item_id)?;
            tx.commit()?;
            Ok(disposition)
        })?;

        match disposition {
            Disposition::Released => {
                log::info!("Job {} interrupted, claim released for a later run", ticket.job_id);
                return Ok(disposition);
            }
            Disposition::Stale => {
                log::warn!("Job {} failed after its claim was lost: {}", ticket.job_id, message);
                return Ok(disposition);
            }
            Disposition::Retrying { delay_secs } => log::warn!(
                "Job {} ({} for item {}) failed, retry {} in {}s: {}",
                ticket.job_id,
                ticket.phase,
                ticket.item_id,
                ticket.attempt + 1,
                delay_secs,
                message
            ),
            Disposition::DeadLettered => log::warn!(
                "Job {} ({} for item {}) moved to dead-letter queue: {}",
                ticket.job_id,
                ticket.phase,
                ticket.item_id,
                message
            ),
            _ => log::warn!(
                "Job {} ({} for item {}) {}: {}",
                ticket.job_id,
                ticket.phase,
                ticket.item_id,
                history.status,
                message
            ),
        }

        let will_retry = matches!(disposition, Disposition::Retrying { .. });
        self.events.publish(PipelineEvent::failed(
            ticket.item_id,
            ticket.phase,
            err.kind(),
            message,
            will_retry,
        ));
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;

    use crate::db::schema::{NewItem, ProcessingStatus};
    use crate::fingerprint::FingerprintType;
    use crate::jobs::fingerprint::FingerprintOutput;
    use crate::jobs::metadata::MediaProbe;
    use crate::jobs::Phase;
    use crate::pipeline::events::ChannelEventSink;

    struct Harness {
        db: Db,
        handler: ResultHandler,
        events: Receiver<PipelineEvent>,
    }

    fn harness() -> Harness {
        let db = Db::open_in_memory().unwrap();
        let (sink, events) = ChannelEventSink::new(64);
        let handler = ResultHandler::new(db.clone(), Arc::new(CancelRegistry::new()), None, Arc::new(sink));
        Harness { db, handler, events }
    }

    fn add_item(db: &Db) -> i64 {
        db.with(|conn| {
            schema::insert_item(conn, &NewItem { path: "/v.mp4".to_string(), title: "v".to_string(), size_bytes: 1 })
        })
        .unwrap()
    }

    fn claim(db: &Db, item_id: i64, phase: Phase, token: &str) -> JobTicket {
        db.with(|conn| {
            schema::enqueue_job(conn, item_id, phase, phase.priority())?;
            let row = schema::claim_next(conn, phase, "test", token, token, 60)?.unwrap();
            Ok(JobTicket {
                job_id: token.to_string(),
                queue_id: row.id,
                item_id,
                phase,
                attempt: row.attempts,
                run_token: token.to_string(),
            })
        })
        .unwrap()
    }

    fn report(ticket: JobTicket, outcome: Result<JobOutput>) -> JobReport {
        JobReport { ticket, started_at: Some(Utc::now()), finished_at: Utc::now(), outcome }
    }

    fn history(db: &Db, item_id: i64) -> Vec<(String, Option<String>)> {
        db.with(|conn| schema::list_job_history(conn, Some(item_id), 100))
            .unwrap()
            .into_iter()
            .map(|h| (h.status, h.error_kind))
            .collect()
    }

    fn set_max_retries(db: &Db, phase: Phase, max_retries: i32) {
        db.with(|conn| {
            let mut retry = schema::get_retry_config(conn, phase)?;
            retry.max_retries = max_retries;
            schema::upsert_retry_config(conn, &retry)
        })
        .unwrap();
    }

    #[test]
    fn test_metadata_success_schedules_dependents() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let probe = MediaProbe {
            duration_secs: 42.0,
            width: Some(1920),
            height: Some(1080),
            audio_codec: Some("aac".to_string()),
            ..Default::default()
        };
        let d = h.handler.process(report(ticket, Ok(JobOutput::Metadata(probe)))).unwrap();
        assert_eq!(d, Disposition::Completed);

        let item = h.db.with(|conn| schema::get_item(conn, id)).unwrap().unwrap();
        assert!(item.metadata_done);
        assert_eq!(item.duration_secs, 42.0);
        assert_eq!(history(&h.db, id), vec![("succeeded".to_string(), None)]);

        let mut queued: Vec<String> = h
            .db
            .with(|conn| schema::list_queue(conn, 10))
            .unwrap()
            .into_iter()
            .map(|r| r.phase)
            .collect();
        queued.sort();
        assert_eq!(queued, vec!["fingerprint", "thumbnail"]);
        assert_eq!(h.events.try_recv().unwrap(), PipelineEvent::completed(id, Phase::Metadata));
    }

    #[test]
    fn test_retry_then_dead_letter() {
        let h = harness();
        set_max_retries(&h.db, Phase::Metadata, 1);
        let id = add_item(&h.db);

        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let d = h.handler.process(report(ticket.clone(), Err(SiftError::Probe("garbage".into())))).unwrap();
        assert!(matches!(d, Disposition::Retrying { delay_secs } if delay_secs > 0));
        let row = h.db.with(|conn| schema::get_queue_row(conn, ticket.queue_id)).unwrap().unwrap();
        assert_eq!((row.status.as_str(), row.attempts), ("pending", 1));
        match h.events.try_recv().unwrap() {
            PipelineEvent::PhaseFailed { will_retry, error_kind, .. } => {
                assert!(will_retry);
                assert_eq!(error_kind, "probe_error");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Make the row due again and run the final attempt
        h.db.with(|conn| {
            conn.execute("UPDATE job_queue SET not_before = datetime('now', '-1 seconds')", [])?;
            Ok(())
        })
        .unwrap();
        let ticket = claim(&h.db, id, Phase::Metadata, "t2");
        assert_eq!(ticket.attempt, 1);
        let d = h.handler.process(report(ticket.clone(), Err(SiftError::Probe("garbage".into())))).unwrap();
        assert_eq!(d, Disposition::DeadLettered);

        h.db.with(|conn| {
            assert!(schema::get_queue_row(conn, ticket.queue_id)?.is_none());
            let dlq = schema::list_dead_letters(conn, Some("pending"), 10)?;
            assert_eq!(dlq.len(), 1);
            assert_eq!(dlq[0].attempts, 2);
            assert_eq!(dlq[0].error_kind, "probe_error");
            assert_eq!(schema::get_item(conn, id)?.unwrap().processing_status, ProcessingStatus::Failed.as_str());
            Ok(())
        })
        .unwrap();
        assert_eq!(history(&h.db, id).len(), 2);
    }

    #[test]
    fn test_timeout_is_distinct() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        h.handler.process(report(ticket, Err(SiftError::Timeout(60)))).unwrap();
        assert_eq!(history(&h.db, id), vec![("timed_out".to_string(), Some("timeout".to_string()))]);
    }

    #[test]
    fn test_cancel_is_terminal_without_dlq() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let d = h
            .handler
            .process(report(ticket.clone(), Err(SiftError::Cancelled("by admin".into()))))
            .unwrap();
        assert_eq!(d, Disposition::Cancelled);
        h.db.with(|conn| {
            assert!(schema::get_queue_row(conn, ticket.queue_id)?.is_none());
            assert!(schema::list_dead_letters(conn, None, 10)?.is_empty());
            Ok(())
        })
        .unwrap();
        assert_eq!(history(&h.db, id), vec![("cancelled".to_string(), Some("cancelled".to_string()))]);
    }

    #[test]
    fn test_interrupted_releases_claim() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let mut r = report(ticket.clone(), Err(SiftError::Interrupted));
        r.started_at = None;
        assert_eq!(h.handler.process(r).unwrap(), Disposition::Released);

        let row = h.db.with(|conn| schema::get_queue_row(conn, ticket.queue_id)).unwrap().unwrap();
        assert_eq!((row.status.as_str(), row.attempts), ("pending", 0));
        assert_eq!(history(&h.db, id), vec![("cancelled".to_string(), Some("interrupted".to_string()))]);
        assert!(h.events.try_recv().is_err());
    }

    #[test]
    fn test_missing_tool_skips_retries() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let d = h
            .handler
            .process(report(ticket, Err(SiftError::ToolNotFound("ffprobe".into()))))
            .unwrap();
        assert_eq!(d, Disposition::DeadLettered);
    }

    #[test]
    fn test_non_retryable_failure() {
        let h = harness();
        let id = add_item(&h.db);
        let ticket = claim(&h.db, id, Phase::Metadata, "t1");
        let d = h
            .handler
            .process(report(ticket, Err(SiftError::Invalid("bad".into()))))
            .unwrap();
        assert_eq!(d, Disposition::Failed);
        assert!(h.db.with(|conn| schema::list_dead_letters(conn, None, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_stale_claim_is_ignored() {
        let h = harness();
        let id = add_item(&h.db);
        let mut ticket = claim(&h.db, id, Phase::Metadata, "t1");
        ticket.run_token = "someone-else".to_string();
        let d = h
            .handler
            .process(report(ticket, Ok(JobOutput::Metadata(MediaProbe { duration_secs: 5.0, ..Default::default() }))))
            .unwrap();
        assert_eq!(d, Disposition::Stale);
        let item = h.db.with(|conn| schema::get_item(conn, id)).unwrap().unwrap();
        assert!(!item.metadata_done);
        assert_eq!(history(&h.db, id).len(), 1);
    }

    #[test]
    fn test_fingerprint_without_matching_service() {
        let h = harness();
        let id = add_item(&h.db);
        h.db.with(|conn| {
            schema::update_item_metadata(conn, id, &MediaProbe { duration_secs: 30.0, ..Default::default() })?;
            schema::set_phase_done(conn, id, Phase::Metadata, true)
        })
        .unwrap();
        let ticket = claim(&h.db, id, Phase::Fingerprint, "t1");
        let output = FingerprintOutput {
            audio: None,
            visual: Some(vec![1, 2, 3]),
            fingerprint_type: FingerprintType::Visual,
        };
        let d = h.handler.process(report(ticket, Ok(JobOutput::Fingerprint(output)))).unwrap();
        assert_eq!(d, Disposition::Completed);
        assert_eq!(
            h.events.try_recv().unwrap(),
            PipelineEvent::completed(id, Phase::Fingerprint).with_detail("visual")
        );
        let stored = h.db.with(|conn| schema::get_item_fingerprints(conn, id)).unwrap().unwrap();
        assert_eq!(stored.visual, Some(vec![1, 2, 3]));
    }

    /// SQLite index that fails the next audio insert when armed
    struct FlakyIndex {
        inner: crate::index::SqliteFingerprintIndex,
        fail_next_insert: std::sync::atomic::AtomicBool,
    }

    impl crate::index::FingerprintIndex for FlakyIndex {
        fn insert_audio_fingerprints(&self, item_id: i64, sub_hashes: &[i32]) -> Result<()> {
            if self.fail_next_insert.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(SiftError::Other("index write failed".to_string()));
            }
            self.inner.insert_audio_fingerprints(item_id, sub_hashes)
        }

        fn insert_visual_fingerprints(&self, item_id: i64, hashes: &[u64]) -> Result<()> {
            self.inner.insert_visual_fingerprints(item_id, hashes)
        }

        fn lookup_audio_hashes(
            &self,
            hashes: &[i32],
        ) -> Result<std::collections::HashMap<i32, Vec<crate::index::AudioHit>>> {
            self.inner.lookup_audio_hashes(hashes)
        }

        fn lookup_visual_chunks(&self, chunk_values: &[u16], chunk_index: usize) -> Result<Vec<crate::index::VisualHit>> {
            self.inner.lookup_visual_chunks(chunk_values, chunk_index)
        }

        fn delete_item_fingerprints(&self, item_id: i64) -> Result<()> {
            self.inner.delete_item_fingerprints(item_id)
        }

        fn health(&self) -> Result<()> {
            self.inner.health()
        }
    }

    #[test]
    fn test_matching_failure_retries_fingerprint() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let db = Db::open_in_memory().unwrap();
        let index = Arc::new(FlakyIndex {
            inner: crate::index::SqliteFingerprintIndex::open_in_memory().unwrap(),
            fail_next_insert: std::sync::atomic::AtomicBool::new(true),
        });
        let duplicates = Arc::new(DuplicateService::new(db.clone(), index));
        let (sink, _events) = ChannelEventSink::new(64);
        let handler = ResultHandler::new(db.clone(), Arc::new(CancelRegistry::new()), Some(duplicates), Arc::new(sink));

        let mut rng = StdRng::seed_from_u64(7);
        let audio: Vec<i32> = (0..400).map(|_| rng.gen()).collect();
        let output = || FingerprintOutput {
            audio: Some(audio.clone()),
            visual: None,
            fingerprint_type: FingerprintType::Audio,
        };
        let add = |name: &str| {
            db.with(|conn| {
                let id = schema::insert_item(conn, &NewItem {
                    path: format!("/v/{}.mp4", name),
                    title: name.to_string(),
                    size_bytes: 1,
                })?;
                schema::update_item_metadata(conn, id, &MediaProbe { duration_secs: 60.0, ..Default::default() })?;
                schema::set_phase_done(conn, id, Phase::Metadata, true)?;
                Ok(id)
            })
            .unwrap()
        };
        let (a, b) = (add("a"), add("b"));

        let ticket = claim(&db, a, Phase::Fingerprint, "a1");
        let d = handler.process(report(ticket.clone(), Ok(JobOutput::Fingerprint(output())))).unwrap();
        assert!(matches!(d, Disposition::Retrying { .. }));
        assert_retry_pending(&db, a, ticket.queue_id);

        // The retry redoes matching against a recovered index
        db.with(|conn| {
            conn.execute("UPDATE job_queue SET not_before = datetime('now', '-1 seconds')", [])?;
            Ok(())
        })
        .unwrap();
        let ticket = claim(&db, a, Phase::Fingerprint, "a2");
        let d = handler.process(report(ticket, Ok(JobOutput::Fingerprint(output())))).unwrap();
        assert_eq!(d, Disposition::Completed);

        let ticket = claim(&db, b, Phase::Fingerprint, "b1");
        assert_eq!(
            handler.process(report(ticket, Ok(JobOutput::Fingerprint(output())))).unwrap(),
            Disposition::Completed
        );

        db.with(|conn| {
            assert!(schema::get_item(conn, a)?.unwrap().fingerprint_done);
            assert!(schema::list_dead_letters(conn, None, 10)?.is_empty());
            let groups = schema::list_groups(conn, Some("unresolved"), 10)?;
            assert_eq!(groups.len(), 1);
            let members: Vec<i64> = schema::get_group_members(conn, groups[0].id)?
                .into_iter()
                .map(|m| m.item_id)
                .collect();
            assert_eq!(members, vec![a, b]);
            Ok(())
        })
        .unwrap();
    }

    fn assert_retry_pending(db: &Db, item_id: i64, queue_id: i64) {
        db.with(|conn| {
            let row = schema::get_queue_row(conn, queue_id)?.unwrap();
            assert_eq!((row.status.as_str(), row.attempts), ("pending", 1));
            assert!(!schema::get_item(conn, item_id)?.unwrap().fingerprint_done);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_pool_stop_records_every_job_once() {
        use crate::jobs::metadata::MetadataJob;
        use crate::jobs::pool::{OutputHandler, WorkerPool};
        use crate::jobs::{CancelToken, MediaJob, QueuedJob};
        use crate::pipeline::events::LogEventSink;

        let db = Db::open_in_memory().unwrap();
        let results = Arc::new(ResultHandler::new(
            db.clone(),
            Arc::new(CancelRegistry::new()),
            None,
            Arc::new(LogEventSink),
        ));
        let sink = Arc::clone(&results);
        let handler: OutputHandler<JobReport> = Arc::new(move |report| sink.handle(report));
        let pool = WorkerPool::new("metadata", 2, 100, handler);
        pool.start().unwrap();

        for i in 0..100 {
            let path = format!("/v/{}.mp4", i);
            let id = db
                .with(|conn| schema::insert_item(conn, &NewItem { path: path.clone(), title: path.clone(), size_bytes: 1 }))
                .unwrap();
            let ticket = claim(&db, id, Phase::Metadata, &format!("t{}", i));
            // Cancelled before it runs, so no external tool is started
            let cancel = CancelToken::new();
            cancel.cancel();
            pool.submit(QueuedJob {
                ticket,
                job: MediaJob::Metadata(MetadataJob::new(id, path.into())),
                cancel,
                timeout_secs: 10,
            })
            .unwrap();
        }
        pool.stop();

        let rows = db.with(|conn| schema::list_job_history(conn, None, 1_000)).unwrap();
        assert_eq!(rows.len(), 100);
        let unique: std::collections::HashSet<&str> = rows.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(unique.len(), 100);
        assert!(rows.iter().all(|r| r.status == HISTORY_CANCELLED));
        assert_eq!(db.with(|conn| schema::count_queue(conn, false)).unwrap(), 0);
    }
}
