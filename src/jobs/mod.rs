// Job system module
//
// A job is ephemeral: it lives only in a pool queue or on a worker thread.
// Its terminal outcome is persisted as job history by the result handler.

pub mod pool;
pub mod metadata;
pub mod thumbnail;
pub mod sprites;
pub mod fingerprint;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, SiftError};
use self::pool::PoolJob;

/// One named stage of the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Metadata,
    Thumbnail,
    Sprites,
    Fingerprint,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Metadata,
        Phase::Thumbnail,
        Phase::Sprites,
        Phase::Fingerprint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Metadata => "metadata",
            Phase::Thumbnail => "thumbnail",
            Phase::Sprites => "sprites",
            Phase::Fingerprint => "fingerprint",
        }
    }

    pub fn parse(s: &str) -> Result<Phase> {
        match s {
            "metadata" => Ok(Phase::Metadata),
            "thumbnail" => Ok(Phase::Thumbnail),
            "sprites" => Ok(Phase::Sprites),
            "fingerprint" => Ok(Phase::Fingerprint),
            other => Err(SiftError::Invalid(format!("unknown phase '{}'", other))),
        }
    }

    /// Queue priority (higher runs first)
    pub fn priority(&self) -> i32 {
        match self {
            Phase::Metadata => METADATA_PRIORITY,
            Phase::Thumbnail => THUMBNAIL_PRIORITY,
            Phase::Sprites => SPRITES_PRIORITY,
            Phase::Fingerprint => FINGERPRINT_PRIORITY,
        }
    }

    /// Completion flag column on the items table
    pub fn done_column(&self) -> &'static str {
        match self {
            Phase::Metadata => "metadata_done",
            Phase::Thumbnail => "thumbnail_done",
            Phase::Sprites => "sprites_done",
            Phase::Fingerprint => "fingerprint_done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ----- Cancellation -----

const TOKEN_LIVE: u8 = 0;
const TOKEN_CANCELLED: u8 = 1;
const TOKEN_INTERRUPTED: u8 = 2;

/// Shared cancel flag for one job. Cancelled means an admin asked for it;
/// interrupted means the process is shutting down.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _ = self.0.compare_exchange(TOKEN_LIVE, TOKEN_CANCELLED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn interrupt(&self) {
        let _ = self.0.compare_exchange(TOKEN_LIVE, TOKEN_INTERRUPTED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) != TOKEN_LIVE
    }

    pub fn check(&self) -> Result<()> {
        match self.0.load(Ordering::SeqCst) {
            TOKEN_CANCELLED => Err(SiftError::Cancelled("cancelled by request".to_string())),
            TOKEN_INTERRUPTED => Err(SiftError::Interrupted),
            _ => Ok(()),
        }
    }
}

/// Cancel tokens of every admitted job, keyed by job id.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a token for a job. Returns the token for the job to carry.
    pub fn register(&self, job_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.lock().insert(job_id.to_string(), token.clone());
        token
    }

    /// Request cancellation of a job. False if the job is not known.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Interrupt every registered job (shutdown deadline passed).
    pub fn interrupt_all(&self) {
        for token in self.lock().values() {
            token.interrupt();
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execution context handed to every job: cancellation plus deadline.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub cancel: CancelToken,
    pub deadline: Instant,
    pub timeout_secs: u64,
}

impl JobContext {
    pub fn new(cancel: CancelToken, timeout_secs: u64) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + Duration::from_secs(timeout_secs),
            timeout_secs,
        }
    }

    /// Cancelled, interrupted or past the deadline.
    pub fn check(&self) -> Result<()> {
        self.cancel.check()?;
        if Instant::now() >= self.deadline {
            return Err(SiftError::Timeout(self.timeout_secs));
        }
        Ok(())
    }
}

// ----- Job types -----

/// The closed set of processing jobs, dispatched by phase.
#[derive(Debug, Clone)]
pub enum MediaJob {
    Metadata(metadata::MetadataJob),
    Thumbnail(thumbnail::ThumbnailJob),
    Sprites(sprites::SpritesJob),
    Fingerprint(fingerprint::FingerprintJob),
}

impl MediaJob {
    pub fn phase(&self) -> Phase {
        match self {
            MediaJob::Metadata(_) => Phase::Metadata,
            MediaJob::Thumbnail(_) => Phase::Thumbnail,
            MediaJob::Sprites(_) => Phase::Sprites,
            MediaJob::Fingerprint(_) => Phase::Fingerprint,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        match self {
            MediaJob::Metadata(j) => j.is_cancellable(),
            MediaJob::Thumbnail(j) => j.is_cancellable(),
            MediaJob::Sprites(j) => j.is_cancellable(),
            MediaJob::Fingerprint(j) => j.is_cancellable(),
        }
    }

    pub fn execute(&self, ctx: &JobContext) -> Result<JobOutput> {
        match self {
            MediaJob::Metadata(j) => j.execute(ctx).map(JobOutput::Metadata),
            MediaJob::Thumbnail(j) => j.execute(ctx).map(JobOutput::Thumbnail),
            MediaJob::Sprites(j) => j.execute(ctx).map(JobOutput::Sprites),
            MediaJob::Fingerprint(j) => j.execute(ctx).map(JobOutput::Fingerprint),
        }
    }
}

/// Typed result of a successful job
#[derive(Debug, Clone)]
pub enum JobOutput {
    Metadata(metadata::MediaProbe),
    Thumbnail(thumbnail::ThumbnailOutput),
    Sprites(sprites::SpriteOutput),
    Fingerprint(fingerprint::FingerprintOutput),
}

/// Identity of an admitted job, tied to its claimed queue row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: String,
    pub queue_id: i64,
    pub item_id: i64,
    pub phase: Phase,
    /// Retries already consumed before this attempt
    pub attempt: i32,
    pub run_token: String,
}

/// What a worker hands back to the dispatcher.
#[derive(Debug)]
pub struct JobReport {
    pub ticket: JobTicket,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Result<JobOutput>,
}

/// A job ready for a pool: ticket, work and cancel token.
#[derive(Debug)]
pub struct QueuedJob {
    pub ticket: JobTicket,
    pub job: MediaJob,
    pub cancel: CancelToken,
    pub timeout_secs: u64,
}

impl PoolJob for QueuedJob {
    type Output = JobReport;

    fn run(self) -> JobReport {
        let started_at = Utc::now();
        // The deadline starts when a worker picks the job up, not at admission
        let ctx = JobContext::new(self.cancel, self.timeout_secs);
        let job = self.job;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.execute(&ctx)))
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(SiftError::Other(format!("job panicked: {}", msg)))
            });
        JobReport {
            ticket: self.ticket,
            started_at: Some(started_at),
            finished_at: Utc::now(),
            outcome,
        }
    }

    fn abandon(self) -> JobReport {
        JobReport {
            ticket: self.ticket,
            started_at: None,
            finished_at: Utc::now(),
            outcome: Err(SiftError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.as_str()).unwrap(), phase);
        }
        assert!(matches!(Phase::parse("proxy"), Err(SiftError::Invalid(_))));
    }

    #[test]
    fn test_cancel_wins_over_later_interrupt() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        token.interrupt();
        assert!(matches!(token.check(), Err(SiftError::Cancelled(_))));
    }

    #[test]
    fn test_registry_cancel_reaches_clone() {
        let registry = CancelRegistry::new();
        let token = registry.register("job-1");
        assert!(registry.cancel("job-1"));
        assert!(!registry.cancel("job-2"));
        assert!(token.is_cancelled());

        registry.remove("job-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_context_deadline_is_timeout() {
        let ctx = JobContext::new(CancelToken::new(), 0);
        assert!(matches!(ctx.check(), Err(SiftError::Timeout(0))));
    }

    #[test]
    fn test_abandon_reports_interrupted() {
        let job = QueuedJob {
            ticket: JobTicket {
                job_id: "j".into(),
                queue_id: 1,
                item_id: 7,
                phase: Phase::Metadata,
                attempt: 0,
                run_token: "t".into(),
            },
            job: MediaJob::Metadata(metadata::MetadataJob::new(7, "/nowhere.mp4".into())),
            cancel: CancelToken::new(),
            timeout_secs: 10,
        };
        let report = job.abandon();
        assert!(report.started_at.is_none());
        assert!(matches!(report.outcome, Err(SiftError::Interrupted)));
    }
}
