// Vidsift Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiftError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External binary missing. Fatal for the phase, not the process.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Work stopped by process shutdown; the claim is released, not failed.
    #[error("Interrupted by shutdown")]
    Interrupted,

    #[error("Worker pool '{0}' is not accepting work")]
    PoolStopped(String),

    #[error("Trigger cycle detected: {0}")]
    CycleDetected(String),

    #[error("Prerequisite not met: {0}")]
    PrerequisiteNotMet(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("{0}")]
    Other(String),
}

impl SiftError {
    /// Stable label surfaced verbatim in job history and the dead-letter queue.
    pub fn kind(&self) -> &'static str {
        match self {
            SiftError::Database(_) => "database",
            SiftError::Io(_) => "io",
            SiftError::Json(_) => "json",
            SiftError::ToolNotFound(_) => "tool_not_found",
            SiftError::Probe(_) => "probe_error",
            SiftError::Extraction(_) => "extraction_error",
            SiftError::Timeout(_) => "timeout",
            SiftError::Cancelled(_) => "cancelled",
            SiftError::Interrupted => "interrupted",
            SiftError::PoolStopped(_) => "pool_stopped",
            SiftError::CycleDetected(_) => "cycle_detected",
            SiftError::PrerequisiteNotMet(_) => "prerequisite_not_met",
            SiftError::NotFound(_) => "not_found",
            SiftError::Invalid(_) => "invalid",
            SiftError::Other(_) => "other",
        }
    }

    /// Whether a failed job may consume retry budget and be requeued.
    pub fn is_retryable(&self) -> bool {
        match self {
            SiftError::Probe(_)
            | SiftError::Extraction(_)
            | SiftError::Timeout(_)
            | SiftError::Database(_)
            | SiftError::Io(_)
            | SiftError::Other(_) => true,
            SiftError::ToolNotFound(_)
            | SiftError::Cancelled(_)
            | SiftError::Interrupted
            | SiftError::PoolStopped(_)
            | SiftError::CycleDetected(_)
            | SiftError::PrerequisiteNotMet(_)
            | SiftError::NotFound(_)
            | SiftError::Invalid(_)
            | SiftError::Json(_) => false,
        }
    }
}

impl From<anyhow::Error> for SiftError {
    fn from(err: anyhow::Error) -> Self {
        SiftError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_matches_taxonomy() {
        assert!(SiftError::Probe("bad json".into()).is_retryable());
        assert!(SiftError::Timeout(30).is_retryable());
        assert!(!SiftError::Cancelled("admin".into()).is_retryable());
        assert!(!SiftError::ToolNotFound("ffprobe".into()).is_retryable());
        assert!(!SiftError::PrerequisiteNotMet("duration".into()).is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(SiftError::Timeout(5).kind(), "timeout");
        assert_eq!(SiftError::CycleDetected("a -> b -> a".into()).kind(), "cycle_detected");
    }
}
