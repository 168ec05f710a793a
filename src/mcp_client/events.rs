//! Registry event bus.
//!
//! Health transitions and completed requests are published on a bounded
//! broadcast channel. Emitting never blocks: when a subscriber falls behind,
//! the oldest events are dropped for that subscriber and it observes
//! `RecvError::Lagged` on its next receive.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::errors::{FailureReason, Phase};

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    HealthChanged {
        server: String,
        ok: bool,
        reason: Option<FailureReason>,
        phase: Option<Phase>,
        at: DateTime<Utc>,
    },
    RequestCompleted {
        server: String,
        method: String,
        ok: bool,
        reason: Option<FailureReason>,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RegistryEvent) {
        tracing::trace!(?event, "registry event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
