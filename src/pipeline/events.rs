// Pipeline event payloads and sinks
//
// Events are emitted after the state transition they describe has been
// committed. Delivery is best effort.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use serde::Serialize;

use crate::jobs::Phase;

/// One event per phase completion or failure, plus group changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseCompleted {
        item_id: i64,
        phase: Phase,
        /// Phase-specific payload, e.g. the fingerprint type label
        detail: Option<String>,
    },
    PhaseFailed {
        item_id: i64,
        phase: Phase,
        error_kind: String,
        message: String,
        will_retry: bool,
    },
    DuplicateGroupUpdated {
        group_id: i64,
        item_id: i64,
    },
}

impl PipelineEvent {
    pub fn completed(item_id: i64, phase: Phase) -> Self {
        PipelineEvent::PhaseCompleted { item_id, phase, detail: None }
    }

    pub fn with_detail(self, detail: impl Into<String>) -> Self {
        match self {
            PipelineEvent::PhaseCompleted { item_id, phase, .. } => PipelineEvent::PhaseCompleted {
                item_id,
                phase,
                detail: Some(detail.into()),
            },
            other => other,
        }
    }

    pub fn failed(item_id: i64, phase: Phase, error_kind: &str, message: impl Into<String>, will_retry: bool) -> Self {
        PipelineEvent::PhaseFailed {
            item_id,
            phase,
            error_kind: error_kind.to_string(),
            message: message.into(),
            will_retry,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: PipelineEvent);
}

/// Writes events to the log as JSON.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: PipelineEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!(target: "vidsift::events", "{}", json),
            Err(e) => log::warn!("Failed to serialize pipeline event: {}", e),
        }
    }
}

/// Bounded in-process channel. Events are dropped when the receiver lags.
pub struct ChannelEventSink {
    tx: SyncSender<PipelineEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::debug!("Event channel full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
