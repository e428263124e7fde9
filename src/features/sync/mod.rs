//! Offline sync queue.
//!
//! Mutations made while offline are stored durably in the queue and replayed
//! against the server once connectivity returns.
//!
//! Features:
//! - Priority ordering with optional dependencies between items
//! - Retry with a fixed backoff table and a bounded attempt budget
//! - Single-flight processing passes, re-triggered on reconnect
//! - Status events for progress reporting

pub mod clock;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod executor;
pub mod operation;
pub mod policy;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use connectivity::{
    BackgroundSync, ConnectionQuality, ConnectivityMonitor, HealthProbe, LoggingBackgroundSync,
    ProbeReport,
};
pub use engine::{
    CleanupReport, EngineConfig, PassOutcome, SyncEngine, SyncEngineBuilder, SyncStats,
};
pub use events::{EventBus, Listener, ListenerId, PassSummary, SyncEvent};
pub use executor::{
    ExecutionError, Executor, FailureKind, HttpRemote, Method, RemoteApi, RemoteExecutor,
    RemoteRequest, RemoteResponse,
};
pub use operation::{
    EnqueueOptions, EntityUpdatePayload, FieldOperationPayload, ImageUploadPayload,
    InspectionPayload, Operation, OperationKind, QueueItem, QueueStatus, VegetationIndexPayload,
};
pub use policy::{RetentionPolicy, RetryPolicy};
pub use queue::{QueueStats, SyncQueue};
