//! The sync queue engine.
//!
//! Accepts new work, runs single-flight processing passes over the queue,
//! applies the retry policy and broadcasts status events. Every engine owns
//! its own processing flag, listeners and timer, so independent instances can
//! coexist.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::connectivity::{BackgroundSync, ConnectivityMonitor, LoggingBackgroundSync};
use super::events::{EventBus, Listener, ListenerId, PassSummary, SyncEvent};
use super::executor::Executor;
use super::operation::{EnqueueOptions, Operation, QueueItem, QueueStatus};
use super::policy::{RetentionPolicy, RetryPolicy};
use super::queue::{QueueStats, SyncQueue};
use crate::config::SyncConfig;
use crate::error::FieldsyncError;
use crate::storage::{from_db_time, to_db_time, Database, LocalStore};

const LAST_SYNC_KEY: &str = "last_sync";

/// Longest a scheduled pass waits; later wake-ups are clamped to this.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Engine behavior switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Start a pass right after `enqueue` when online
    pub process_on_enqueue: bool,
    /// Delay of the follow-up pass scheduled when runnable work remains
    pub followup_delay: Duration,
    /// Tag handed to the background sync hook on reconnect
    pub background_sync_tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&SyncConfig::default())
    }
}

impl EngineConfig {
    /// Build from configuration.
    #[must_use]
    pub fn from_settings(settings: &SyncConfig) -> Self {
        Self {
            process_on_enqueue: settings.process_on_enqueue,
            followup_delay: Duration::from_millis(settings.followup_delay_ms),
            background_sync_tag: settings.background_sync_tag.clone(),
        }
    }
}

/// Result of a `process_queue` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Another pass was active; nothing was done
    AlreadyRunning,
    /// The device is offline; nothing was done
    Offline,
    /// A pass ran to its end or was interrupted
    Finished(PassSummary),
}

/// Queue counters plus engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    /// End of the last pass that ran to completion
    pub last_sync: Option<DateTime<Utc>>,
    pub online: bool,
    pub processing: bool,
}

/// Result of `cleanup`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed: usize,
    pub failed: usize,
}

impl CleanupReport {
    /// Total items removed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed
    }
}

struct ScheduledPass {
    due: tokio::time::Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    queue: SyncQueue,
    store: LocalStore,
    executor: Arc<dyn Executor>,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    background: Arc<dyn BackgroundSync>,
    config: EngineConfig,
    processing: AtomicBool,
    timer: Mutex<Option<ScheduledPass>>,
    timer_generation: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

/// Clears the processing flag when a pass ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    db: Arc<Database>,
    executor: Arc<dyn Executor>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    clock: Arc<dyn Clock>,
    background: Arc<dyn BackgroundSync>,
    config: EngineConfig,
}

impl SyncEngineBuilder {
    /// Share a connectivity monitor with the host.
    #[must_use]
    pub fn connectivity(mut self, monitor: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the retention policy.
    #[must_use]
    pub const fn retention_policy(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    /// Set the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the background sync hook.
    #[must_use]
    pub fn background_sync(mut self, hook: Arc<dyn BackgroundSync>) -> Self {
        self.background = hook;
        self
    }

    /// Set the engine switches.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply the `sync` configuration section.
    #[must_use]
    pub fn settings(self, settings: &SyncConfig) -> Self {
        self.retry_policy(RetryPolicy::from_settings(settings))
            .retention_policy(RetentionPolicy::from_settings(settings))
            .config(EngineConfig::from_settings(settings))
    }

    /// Build the engine. It starts idle; call [`SyncEngine::start`] to
    /// recover interrupted items and follow connectivity.
    #[must_use]
    pub fn build(self) -> SyncEngine {
        SyncEngine {
            inner: Arc::new(Inner {
                queue: SyncQueue::with_database(Arc::clone(&self.db)),
                store: LocalStore::new(self.db),
                executor: self.executor,
                connectivity: self.connectivity.unwrap_or_default(),
                events: EventBus::new(),
                retry: self.retry,
                retention: self.retention,
                clock: self.clock,
                background: self.background,
                config: self.config,
                processing: AtomicBool::new(false),
                timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
                watcher: Mutex::new(None),
            }),
        }
    }
}

/// Offline sync queue engine.
///
/// Cheap to clone; clones share the same queue, flag and listeners.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Start building an engine over a database and an executor.
    #[must_use]
    pub fn builder(db: Arc<Database>, executor: Arc<dyn Executor>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            db,
            executor,
            connectivity: None,
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
            clock: Arc::new(SystemClock),
            background: Arc::new(LoggingBackgroundSync),
            config: EngineConfig::default(),
        }
    }

    /// The connectivity monitor gating this engine.
    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.connectivity
    }

    /// Whether the connectivity monitor reports online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Whether a pass is active.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Whether no pass is running and none is scheduled.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_processing()
            && self
                .inner
                .timer
                .lock()
                .as_ref()
                .map_or(true, |t| t.handle.is_finished())
    }

    /// Register an event listener.
    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.inner.events.subscribe(listener)
    }

    /// Remove an event listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Durably queue an operation.
    ///
    /// Never touches the network. When online (and enabled) a pass is
    /// started in the background on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `depends_on` names an id that was never
    /// assigned, or a database error if the write fails.
    pub fn enqueue(
        &self,
        operation: Operation,
        options: EnqueueOptions,
    ) -> Result<QueueItem, FieldsyncError> {
        let key = uuid::Uuid::new_v4().to_string();
        let item = self
            .inner
            .queue
            .insert(&operation, &options, self.inner.clock.now(), &key)?;

        info!(id = item.id, operation = %item.kind(), priority = item.priority, "Queued operation");
        self.emit(&SyncEvent::Enqueued {
            id: item.id,
            kind: item.kind(),
        });

        if self.inner.config.process_on_enqueue && self.is_online() {
            self.schedule_in(Duration::ZERO);
        }

        Ok(item)
    }

    /// Run one processing pass.
    ///
    /// Returns without doing anything if another pass is active or the
    /// device is offline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; the pass is aborted and an
    /// `error` event is emitted before `completed`. Executor failures are not
    /// errors.
    pub async fn process_queue(&self) -> Result<PassOutcome, FieldsyncError> {
        if !self.is_online() {
            debug!("Offline, not processing");
            return Ok(PassOutcome::Offline);
        }
        let Some(guard) = ProcessingGuard::acquire(&self.inner.processing) else {
            debug!("Pass already running");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let mut summary = PassSummary::default();
        let result = self.run_pass(&mut summary).await;
        drop(guard);

        if let Err(e) = &result {
            error!(error = %e, "Sync pass aborted");
            self.emit(&SyncEvent::Error {
                message: e.to_string(),
            });
        }
        self.emit(&SyncEvent::Completed {
            at: self.inner.clock.now(),
            summary: summary.clone(),
        });
        result?;

        if !summary.interrupted {
            self.schedule_next()?;
        }
        Ok(PassOutcome::Finished(summary))
    }

    async fn run_pass(&self, summary: &mut PassSummary) -> Result<(), FieldsyncError> {
        let inner = &self.inner;
        let started = inner.clock.now();
        self.emit(&SyncEvent::Processing { at: started });

        let due = inner.queue.due(started)?;

        if due.is_empty() {
            self.emit(&SyncEvent::Empty);
        }
        debug!(count = due.len(), "Starting sync pass");

        for candidate in due {
            if !self.is_online() {
                info!("Went offline, stopping pass");
                summary.interrupted = true;
                break;
            }

            if !self.dependency_met(&candidate)? {
                debug!(
                    id = candidate.id,
                    depends_on = ?candidate.depends_on,
                    "Dependency not complete, skipping"
                );
                summary.skipped += 1;
                continue;
            }

            // Cancelled or otherwise changed since selection
            if !inner.queue.claim(candidate.id, inner.clock.now())? {
                continue;
            }

            let mut item = candidate;
            item.status = QueueStatus::Syncing;
            summary.attempted += 1;
            self.emit(&SyncEvent::ItemStart {
                id: item.id,
                kind: item.kind(),
            });

            match inner.executor.execute(&item).await {
                Ok(result) => {
                    self.complete(&item, &result)?;
                    summary.succeeded += 1;
                    self.emit(&SyncEvent::ItemSuccess {
                        id: item.id,
                        result,
                    });
                }
                Err(failure) => {
                    let attempts = item.attempts.saturating_add(1);
                    let give_up = inner.retry.is_exhausted(attempts)
                        || (inner.retry.fail_fast_on_permanent && failure.is_permanent());

                    if give_up {
                        inner.queue.record_failure(
                            item.id,
                            attempts,
                            QueueStatus::Failed,
                            &failure.message,
                            None,
                        )?;
                        warn!(
                            id = item.id,
                            attempts,
                            error = %failure,
                            "Operation failed permanently"
                        );
                        summary.failed += 1;
                        self.emit(&SyncEvent::ItemFailed {
                            id: item.id,
                            attempts,
                            error: failure.message,
                        });
                    } else {
                        let delay = inner.retry.delay_for(attempts);
                        let next = after(inner.clock.now(), delay);
                        inner.queue.record_failure(
                            item.id,
                            attempts,
                            QueueStatus::Retrying,
                            &failure.message,
                            Some(next),
                        )?;
                        info!(
                            id = item.id,
                            attempts,
                            delay_secs = delay.as_secs(),
                            error = %failure,
                            "Operation will be retried"
                        );
                        summary.retried += 1;
                        self.emit(&SyncEvent::ItemRetry {
                            id: item.id,
                            attempt: attempts,
                            delay,
                            error: failure.message,
                        });
                        self.schedule_in(delay);
                    }
                }
            }
        }

        if !summary.interrupted {
            inner
                .store
                .set_meta(LAST_SYNC_KEY, &to_db_time(inner.clock.now()))?;
        }

        Ok(())
    }

    fn dependency_met(&self, item: &QueueItem) -> Result<bool, FieldsyncError> {
        let Some(dep) = item.depends_on else {
            return Ok(true);
        };
        // A dependency that is gone completed and was pruned
        Ok(matches!(
            self.inner.queue.status_of(dep)?,
            None | Some(QueueStatus::Completed)
        ))
    }

    fn complete(&self, item: &QueueItem, result: &serde_json::Value) -> Result<(), FieldsyncError> {
        let inner = &self.inner;
        if inner.retention.removes_on_completion() {
            inner.queue.delete(item.id)?;
        } else {
            inner
                .queue
                .mark_completed(item.id, result, inner.clock.now())?;
        }
        info!(id = item.id, operation = %item.kind(), "Operation synced");
        Ok(())
    }

    /// Schedule a follow-up pass if runnable work remains, otherwise wake up
    /// for the earliest pending retry.
    fn schedule_next(&self) -> Result<(), FieldsyncError> {
        if !self.is_online() {
            return Ok(());
        }
        let now = self.inner.clock.now();

        let mut runnable = false;
        for item in self.inner.queue.due(now)? {
            if self.dependency_met(&item)? {
                runnable = true;
                break;
            }
        }

        if runnable {
            self.schedule_in(self.inner.config.followup_delay);
        } else if let Some(next) = self.inner.queue.next_retry_at()? {
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            self.schedule_in(wait);
        }
        Ok(())
    }

    /// Arrange for a pass to run after `delay`.
    ///
    /// Keeps an already scheduled pass that fires no later. Without a tokio
    /// runtime nothing is scheduled; the next explicit `process_queue` call
    /// picks the work up.
    fn schedule_in(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, pass not scheduled");
            return;
        };
        let now = tokio::time::Instant::now();
        let due = now.checked_add(delay).unwrap_or_else(|| now + MAX_TIMER_DELAY);

        let mut slot = self.inner.timer.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.due <= due && !existing.handle.is_finished() {
                return;
            }
        }
        if let Some(existing) = slot.take() {
            existing.handle.abort();
        }

        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(due).await;
            let Some(engine) = SyncEngine::upgrade(&weak) else {
                return;
            };
            {
                // Replaced or cancelled after this timer woke
                let mut slot = engine.inner.timer.lock();
                if !slot.as_ref().is_some_and(|t| t.generation == generation) {
                    return;
                }
                // From here on nothing holds the handle, so the pass cannot be aborted
                *slot = None;
            }
            if let Err(e) = engine.process_queue().await {
                error!(error = %e, "Scheduled sync pass failed");
            }
        });

        debug!(delay_ms = delay.as_millis(), "Scheduled sync pass");
        *slot = Some(ScheduledPass {
            due,
            generation,
            handle,
        });
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.handle.abort();
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn emit(&self, event: &SyncEvent) {
        self.inner.events.emit(event);
    }

    /// Remove an item that has not been handed to an executor.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InvalidState` for items that
    /// are `Syncing`, `Completed` or still depended on by waiting items.
    pub fn cancel(&self, id: i64) -> Result<QueueItem, FieldsyncError> {
        let item = self.inner.queue.remove_cancellable(id)?;
        info!(id, operation = %item.kind(), "Cancelled operation");
        self.emit(&SyncEvent::Cancelled { id });
        Ok(item)
    }

    /// Reset every `Failed` item to `Pending` and run a pass.
    ///
    /// Returns the number of items reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn retry_failed(&self) -> Result<usize, FieldsyncError> {
        let ids = self.inner.queue.reset_failed()?;
        info!(count = ids.len(), "Reset failed operations");
        self.emit(&SyncEvent::RetryAll { count: ids.len() });

        self.process_queue().await?;
        Ok(ids.len())
    }

    /// Reset one `Failed` item to `Pending` and run a pass.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InvalidState` if the item is not `Failed`, or a
    /// store error.
    pub async fn retry(&self, id: i64) -> Result<(), FieldsyncError> {
        self.inner.queue.reset(id)?;
        info!(id, "Reset failed operation");
        self.emit(&SyncEvent::RetryAll { count: 1 });

        self.process_queue().await?;
        Ok(())
    }

    /// Purge terminal items past their retention window.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn cleanup(&self) -> Result<CleanupReport, FieldsyncError> {
        let now = self.inner.clock.now();
        let retention = &self.inner.retention;

        let report = CleanupReport {
            completed: self
                .inner
                .queue
                .purge_before(QueueStatus::Completed, before(now, retention.completed_window()))?,
            failed: self
                .inner
                .queue
                .purge_before(QueueStatus::Failed, before(now, retention.cleanup_after))?,
        };

        info!(completed = report.completed, failed = report.failed, "Cleaned up sync queue");
        Ok(report)
    }

    /// Queue counters and engine state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn stats(&self) -> Result<SyncStats, FieldsyncError> {
        Ok(SyncStats {
            queue: self.inner.queue.stats()?,
            last_sync: self.last_sync()?,
            online: self.is_online(),
            processing: self.is_processing(),
        })
    }

    /// End of the last pass that ran to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>, FieldsyncError> {
        Ok(self
            .inner
            .store
            .get_meta(LAST_SYNC_KEY)?
            .map(|s| from_db_time(&s)))
    }

    /// Get one item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get(&self, id: i64) -> Result<Option<QueueItem>, FieldsyncError> {
        self.inner.queue.get(id)
    }

    /// List items, optionally by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, FieldsyncError> {
        self.inner.queue.list(status, limit)
    }

    /// Items still waiting for delivery (`Pending` or `Retrying`).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn pending(&self) -> Result<Vec<QueueItem>, FieldsyncError> {
        let mut items = self.inner.queue.list(Some(QueueStatus::Pending), usize::MAX)?;
        items.extend(self.inner.queue.list(Some(QueueStatus::Retrying), usize::MAX)?);
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    /// Items out of retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn failed(&self) -> Result<Vec<QueueItem>, FieldsyncError> {
        self.inner.queue.list(Some(QueueStatus::Failed), usize::MAX)
    }

    /// Recover from a previous crash and start following connectivity.
    ///
    /// Items left in `Syncing` are returned to `Pending`. When online, a
    /// pass runs before this returns. Returns the number of recovered items.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn start(&self) -> Result<usize, FieldsyncError> {
        let recovered = self.inner.queue.recover_interrupted()?;
        if recovered > 0 {
            warn!(count = recovered, "Recovered operations interrupted mid-sync");
        }

        self.spawn_watcher();

        if self.is_online() {
            self.process_queue().await?;
        }
        Ok(recovered)
    }

    fn spawn_watcher(&self) {
        let mut rx = self.inner.connectivity.subscribe();
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                let Some(engine) = SyncEngine::upgrade(&weak) else {
                    break;
                };
                engine.on_connectivity_change(online);
            }
        });

        if let Some(previous) = self.inner.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn on_connectivity_change(&self, online: bool) {
        if online {
            info!("Back online");
            self.emit(&SyncEvent::Online);
            // Detached from the watcher: stopping it must not cut a pass short
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.process_queue().await {
                    error!(error = %e, "Sync pass after reconnect failed");
                }
                engine
                    .inner
                    .background
                    .request(&engine.inner.config.background_sync_tag);
            });
        } else {
            info!("Went offline");
            self.emit(&SyncEvent::Offline);
            self.cancel_timer();
        }
    }

    /// Stop following connectivity and drop any scheduled pass.
    ///
    /// A pass that is already running is left to finish, so no item is
    /// abandoned mid-delivery.
    pub fn shutdown(&self) {
        self.cancel_timer();
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
    }
}

/// 9999-12-31T23:59:59Z, the last instant whose stored form sorts in order.
const LATEST_STORED_SECS: i64 = 253_402_300_799;

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let latest = DateTime::<Utc>::from_timestamp(LATEST_STORED_SECS, 0).unwrap_or(now);
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |t| t.min(latest))
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
