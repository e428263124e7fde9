//! Sync status events and the listener registry.
//!
//! Listeners are called synchronously, in subscription order, once per event.
//! A panicking listener is logged and skipped; it never reaches the engine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use super::operation::OperationKind;

/// Counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Items handed to the executor
    pub attempted: usize,
    pub succeeded: usize,
    /// Items moved to `Retrying`
    pub retried: usize,
    /// Items moved to `Failed`
    pub failed: usize,
    /// Items left alone because their dependency is not complete
    pub skipped: usize,
    /// The pass stopped early because connectivity was lost
    pub interrupted: bool,
}

/// Something observable happened in the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// An item was durably queued
    Enqueued { id: i64, kind: OperationKind },
    /// A pass started
    Processing { at: DateTime<Utc> },
    /// An item was handed to its executor
    ItemStart { id: i64, kind: OperationKind },
    /// An executor succeeded
    ItemSuccess { id: i64, result: Value },
    /// An executor failed and the item will be retried
    ItemRetry {
        id: i64,
        attempt: u32,
        #[serde(with = "duration_secs")]
        delay: Duration,
        error: String,
    },
    /// An executor failed and the item is out of retries
    ItemFailed { id: i64, attempts: u32, error: String },
    /// A pass finished, or was aborted after an `error`
    Completed {
        at: DateTime<Utc>,
        summary: PassSummary,
    },
    /// A pass found nothing to do
    Empty,
    /// A pass was aborted by a storage failure
    Error { message: String },
    /// Connectivity came back
    Online,
    /// Connectivity was lost
    Offline,
    /// An item was removed by `cancel`
    Cancelled { id: i64 },
    /// Failed items were reset by a retry action
    RetryAll { count: usize },
}

impl SyncEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Processing { .. } => "processing",
            Self::ItemStart { .. } => "item-start",
            Self::ItemSuccess { .. } => "item-success",
            Self::ItemRetry { .. } => "item-retry",
            Self::ItemFailed { .. } => "item-failed",
            Self::Completed { .. } => "completed",
            Self::Empty => "empty",
            Self::Error { .. } => "error",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Cancelled { .. } => "cancelled",
            Self::RetryAll { .. } => "retry-all",
        }
    }

    /// Queue item the event refers to, if any.
    #[must_use]
    pub const fn item_id(&self) -> Option<i64> {
        match self {
            Self::Enqueued { id, .. }
            | Self::ItemStart { id, .. }
            | Self::ItemSuccess { id, .. }
            | Self::ItemRetry { id, .. }
            | Self::ItemFailed { id, .. }
            | Self::Cancelled { id } => Some(*id),
            Self::Processing { .. }
            | Self::Completed { .. }
            | Self::Empty
            | Self::Error { .. }
            | Self::Online
            | Self::Offline
            | Self::RetryAll { .. } => None,
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// Event callback.
pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered list of listeners.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It sees every event emitted after this call.
    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver an event to every listener in subscription order.
    pub fn emit(&self, event: &SyncEvent) {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(event = event.name(), "Sync event listener panicked");
            }
        }
    }
}
