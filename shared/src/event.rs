use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::outbox::RequestId;
use crate::ErrorKind;

const DEFAULT_CAPACITY: usize = 64;

/// Why a queued mutation was given up on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropReason {
    /// The server rejected the request with a status it will never accept.
    Rejected { status: u16 },
    RetriesExhausted { attempts: u32 },
    Expired,
    /// The stored record can no longer be turned into a request (bad URL, oversized body).
    Malformed,
}

impl DropReason {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            DropReason::Rejected { .. } => ErrorKind::ServerFatal,
            DropReason::RetriesExhausted { .. } | DropReason::Expired => ErrorKind::QueueExhausted,
            DropReason::Malformed => ErrorKind::InvalidRequest,
        }
    }
}

/// Notifications for UI collaborators. Delivery is best effort: a slow receiver
/// that falls behind the channel capacity skips ahead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    QueuedOffline { id: RequestId },
    Synced { id: RequestId },
    Dropped { id: RequestId, reason: DropReason },
    Rescheduled { id: RequestId, retry_count: u32, delay_ms: u64 },
    TokensRefreshed,
    /// The refresh token was rejected; the UI should return to the sign-in screen.
    SessionExpired,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        // No subscribers is not an error.
        if self.tx.send(event).is_err() {
            trace!("pipeline event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
