//! Sync queue storage and management.
//!
//! Provides persistence and querying of queued operations. Every status
//! transition that the engine and the caller could race on is a single
//! conditional statement under the connection lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::operation::{EnqueueOptions, Operation, OperationKind, QueueItem, QueueStatus};
use crate::error::FieldsyncError;
use crate::storage::{from_db_time, to_db_time, Database};

const SELECT_COLUMNS: &str = r"SELECT id, operation_type, payload, priority, depends_on, status,
       attempts, created_at, last_attempt, next_eligible_at, last_error,
       result, idempotency_key, origin
  FROM sync_queue";

/// Persistent queue of offline mutations.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Database>,
}

impl SyncQueue {
    /// Create a sync queue on a shared database.
    #[must_use]
    pub const fn with_database(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Add an operation to the queue as `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `depends_on` names an id that was never
    /// assigned, or a database error if the insert fails.
    pub fn insert(
        &self,
        operation: &Operation,
        options: &EnqueueOptions,
        created_at: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<QueueItem, FieldsyncError> {
        let payload = operation.payload_json()?;
        let conn = self.db.connection();

        // Ids handed out so far; a dependency that completed and was pruned
        // is still among them and counts as satisfied.
        if let Some(dep) = options.depends_on {
            let last_assigned: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM sqlite_sequence WHERE name = 'sync_queue'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| FieldsyncError::Database(format!("Failed to check dependency: {e}")))?;
            if dep < 1 || last_assigned.map_or(true, |last| dep > last) {
                return Err(FieldsyncError::NotFound(format!(
                    "Dependency {dep} was never queued"
                )));
            }
        }

        conn.execute(
            r"INSERT INTO sync_queue
              (operation_type, payload, priority, depends_on, status, attempts,
               created_at, idempotency_key, origin)
              VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, ?7)",
            params![
                operation.kind().as_str(),
                payload,
                options.priority,
                options.depends_on,
                to_db_time(created_at),
                idempotency_key,
                options.origin,
            ],
        )
        .map_err(|e| FieldsyncError::Database(format!("Failed to enqueue operation: {e}")))?;

        Ok(QueueItem {
            id: conn.last_insert_rowid(),
            operation: operation.clone(),
            priority: options.priority,
            depends_on: options.depends_on,
            status: QueueStatus::Pending,
            attempts: 0,
            created_at,
            last_attempt_at: None,
            next_eligible_at: None,
            last_error: None,
            result: None,
            idempotency_key: idempotency_key.to_string(),
            origin: options.origin.clone(),
        })
    }

    /// Get a specific item by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: i64) -> Result<Option<QueueItem>, FieldsyncError> {
        self.db
            .connection()
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], row_to_item)
            .optional()
            .map_err(|e| FieldsyncError::Database(format!("Failed to query item {id}: {e}")))
    }

    /// Status of an item, if it still exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn status_of(&self, id: i64) -> Result<Option<QueueStatus>, FieldsyncError> {
        let status: Option<String> = self
            .db
            .connection()
            .query_row("SELECT status FROM sync_queue WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| FieldsyncError::Database(format!("Failed to query status: {e}")))?;

        status.map(|s| s.parse()).transpose()
    }

    /// List items, optionally filtered by status, in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, FieldsyncError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match status {
            Some(status) => self.query_items(
                &format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY id ASC LIMIT ?2"),
                params![status.as_str(), limit],
            ),
            None => self.query_items(
                &format!("{SELECT_COLUMNS} ORDER BY id ASC LIMIT ?1"),
                params![limit],
            ),
        }
    }

    /// Items the scheduler may pick at `now`, ordered by priority then age.
    ///
    /// Includes every `Pending` item and every `Retrying` item whose backoff
    /// has elapsed. Dependencies are not checked here.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>, FieldsyncError> {
        self.query_items(
            &format!(
                "{SELECT_COLUMNS}
                 WHERE status = 'pending'
                    OR (status = 'retrying'
                        AND (next_eligible_at IS NULL OR next_eligible_at <= ?1))
                 ORDER BY priority ASC, created_at ASC, id ASC"
            ),
            params![to_db_time(now)],
        )
    }

    /// Earliest backoff deadline among `Retrying` items.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn next_retry_at(&self) -> Result<Option<DateTime<Utc>>, FieldsyncError> {
        let next: Option<String> = self
            .db
            .connection()
            .query_row(
                "SELECT MIN(next_eligible_at) FROM sync_queue WHERE status = 'retrying'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to query retries: {e}")))?;

        Ok(next.map(|s| from_db_time(&s)))
    }

    /// Move an item to `Syncing` if it is still `Pending` or `Retrying`.
    ///
    /// Returns `false` when the item was cancelled or changed since it was
    /// selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn claim(&self, id: i64, now: DateTime<Utc>) -> Result<bool, FieldsyncError> {
        let rows = self
            .db
            .connection()
            .execute(
                r"UPDATE sync_queue SET status = 'syncing', last_attempt = ?1
                  WHERE id = ?2 AND status IN ('pending', 'retrying')",
                params![to_db_time(now), id],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to claim item {id}: {e}")))?;

        Ok(rows > 0)
    }

    /// Mark an item completed and store the server result.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn mark_completed(
        &self,
        id: i64,
        result: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), FieldsyncError> {
        let result = serde_json::to_string(result)?;

        self.db
            .connection()
            .execute(
                r"UPDATE sync_queue SET
                  status = 'completed',
                  result = ?1,
                  last_attempt = ?2,
                  last_error = NULL,
                  next_eligible_at = NULL
                  WHERE id = ?3",
                params![result, to_db_time(now), id],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to mark item completed: {e}")))?;

        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `status` is `Retrying` (with a backoff deadline) or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn record_failure(
        &self,
        id: i64,
        attempts: u32,
        status: QueueStatus,
        error: &str,
        next_eligible_at: Option<DateTime<Utc>>,
    ) -> Result<(), FieldsyncError> {
        self.db
            .connection()
            .execute(
                r"UPDATE sync_queue SET
                  status = ?1,
                  attempts = ?2,
                  last_error = ?3,
                  next_eligible_at = ?4
                  WHERE id = ?5",
                params![
                    status.as_str(),
                    attempts,
                    error,
                    next_eligible_at.map(to_db_time),
                    id,
                ],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to record attempt: {e}")))?;

        Ok(())
    }

    /// Remove an item that has not been handed to an executor.
    ///
    /// Accepts `Pending`, `Retrying` and `Failed` items that no waiting item
    /// depends on.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `InvalidState` for `Syncing` or
    /// `Completed` items, or a database error.
    pub fn remove_cancellable(&self, id: i64) -> Result<QueueItem, FieldsyncError> {
        let conn = self.db.connection();

        let item = conn
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], row_to_item)
            .optional()
            .map_err(|e| FieldsyncError::Database(format!("Failed to query item {id}: {e}")))?
            .ok_or_else(|| FieldsyncError::NotFound(format!("Queue item {id}")))?;

        match item.status {
            QueueStatus::Syncing | QueueStatus::Completed => {
                return Err(FieldsyncError::InvalidState(format!(
                    "Queue item {id} is {} and cannot be cancelled",
                    item.status
                )));
            }
            QueueStatus::Pending | QueueStatus::Retrying | QueueStatus::Failed => {}
        }

        let waiting: i64 = conn
            .query_row(
                r"SELECT COUNT(*) FROM sync_queue
                  WHERE depends_on = ?1 AND status IN ('pending', 'retrying')",
                [id],
                |row| row.get(0),
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to check dependents: {e}")))?;
        if waiting > 0 {
            return Err(FieldsyncError::InvalidState(format!(
                "Queue item {id} has {waiting} waiting dependent(s); cancel them first"
            )));
        }

        conn.execute("DELETE FROM sync_queue WHERE id = ?1", [id])
            .map_err(|e| FieldsyncError::Database(format!("Failed to delete item {id}: {e}")))?;

        Ok(item)
    }

    /// Delete an item unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, id: i64) -> Result<bool, FieldsyncError> {
        let rows = self
            .db
            .connection()
            .execute("DELETE FROM sync_queue WHERE id = ?1", [id])
            .map_err(|e| FieldsyncError::Database(format!("Failed to delete item {id}: {e}")))?;

        Ok(rows > 0)
    }

    /// Reset every `Failed` item to `Pending` with a fresh retry budget.
    ///
    /// Returns the ids that were reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn reset_failed(&self) -> Result<Vec<i64>, FieldsyncError> {
        let conn = self.db.connection();

        let ids = {
            let mut stmt = conn
                .prepare("SELECT id FROM sync_queue WHERE status = 'failed' ORDER BY id ASC")
                .map_err(|e| FieldsyncError::Database(format!("Failed to prepare query: {e}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(|e| FieldsyncError::Database(format!("Failed to query failed: {e}")))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.map_err(|e| FieldsyncError::Database(e.to_string()))?);
            }
            ids
        };

        conn.execute(
            r"UPDATE sync_queue SET
              status = 'pending',
              attempts = 0,
              last_error = NULL,
              next_eligible_at = NULL
              WHERE status = 'failed'",
            [],
        )
        .map_err(|e| FieldsyncError::Database(format!("Failed to reset failed items: {e}")))?;

        Ok(ids)
    }

    /// Reset a single `Failed` item to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `InvalidState` if the item is not
    /// `Failed`, or a database error.
    pub fn reset(&self, id: i64) -> Result<(), FieldsyncError> {
        let rows = self
            .db
            .connection()
            .execute(
                r"UPDATE sync_queue SET
                  status = 'pending',
                  attempts = 0,
                  last_error = NULL,
                  next_eligible_at = NULL
                  WHERE id = ?1 AND status = 'failed'",
                [id],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to reset item {id}: {e}")))?;

        if rows > 0 {
            return Ok(());
        }
        match self.status_of(id)? {
            None => Err(FieldsyncError::NotFound(format!("Queue item {id}"))),
            Some(status) => Err(FieldsyncError::InvalidState(format!(
                "Queue item {id} is {status}, only failed items can be retried"
            ))),
        }
    }

    /// Return items left in `Syncing` by an interrupted process to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_interrupted(&self) -> Result<usize, FieldsyncError> {
        self.db
            .connection()
            .execute(
                "UPDATE sync_queue SET status = 'pending' WHERE status = 'syncing'",
                [],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to recover items: {e}")))
    }

    /// Delete terminal items with the given status last touched before `cutoff`.
    ///
    /// Items that waiting dependents still point at are kept.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for non-terminal statuses, or a database
    /// error if the delete fails.
    pub fn purge_before(
        &self,
        status: QueueStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FieldsyncError> {
        if !status.is_terminal() {
            return Err(FieldsyncError::InvalidArgument(format!(
                "Refusing to purge {status} items"
            )));
        }

        self.db
            .connection()
            .execute(
                r"DELETE FROM sync_queue
                  WHERE status = ?1
                    AND COALESCE(last_attempt, created_at) < ?2
                    AND NOT EXISTS (
                      SELECT 1 FROM sync_queue AS dependent
                      WHERE dependent.depends_on = sync_queue.id
                        AND dependent.status IN ('pending', 'retrying')
                    )",
                params![status.as_str(), to_db_time(cutoff)],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to cleanup operations: {e}")))
    }

    /// Get queue statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn stats(&self) -> Result<QueueStats, FieldsyncError> {
        let conn = self.db.connection();
        let mut stats = QueueStats::default();

        {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
                .map_err(|e| FieldsyncError::Database(format!("Failed to prepare query: {e}")))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| FieldsyncError::Database(format!("Failed to count items: {e}")))?;

            for row in rows {
                let (status, count) = row.map_err(|e| FieldsyncError::Database(e.to_string()))?;
                match status.parse::<QueueStatus>()? {
                    QueueStatus::Pending => stats.pending = count,
                    QueueStatus::Syncing => stats.syncing = count,
                    QueueStatus::Retrying => stats.retrying = count,
                    QueueStatus::Completed => stats.completed = count,
                    QueueStatus::Failed => stats.failed = count,
                }
            }
        }

        let oldest_pending: Option<String> = conn
            .query_row(
                "SELECT MIN(created_at) FROM sync_queue WHERE status IN ('pending', 'retrying')",
                [],
                |row| row.get(0),
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to get oldest pending: {e}")))?;
        stats.oldest_pending = oldest_pending.map(|s| from_db_time(&s));

        Ok(stats)
    }

    fn query_items(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<QueueItem>, FieldsyncError> {
        let conn = self.db.connection();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| FieldsyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params, row_to_item)
            .map_err(|e| FieldsyncError::Database(format!("Failed to query queue: {e}")))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.map_err(|e| FieldsyncError::Database(e.to_string()))?);
        }

        Ok(items)
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub syncing: i64,
    pub retrying: i64,
    pub completed: i64,
    pub failed: i64,
    /// Creation time of the oldest item still waiting for delivery
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Items not yet delivered and not given up on.
    #[must_use]
    pub const fn outstanding(&self) -> i64 {
        self.pending + self.syncing + self.retrying
    }
}

fn conversion_error(
    column: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_item(row: &Row<'_>) -> Result<QueueItem, rusqlite::Error> {
    let id: i64 = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let priority: i32 = row.get(3)?;
    let depends_on: Option<i64> = row.get(4)?;
    let status_str: String = row.get(5)?;
    let attempts: u32 = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let last_attempt_str: Option<String> = row.get(8)?;
    let next_eligible_str: Option<String> = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;
    let result_str: Option<String> = row.get(11)?;
    let idempotency_key: String = row.get(12)?;
    let origin: String = row.get(13)?;

    let kind: OperationKind = kind_str.parse().map_err(|e| conversion_error(1, e))?;
    let operation = Operation::from_parts(kind, &payload).map_err(|e| conversion_error(2, e))?;
    let status: QueueStatus = status_str.parse().map_err(|e| conversion_error(5, e))?;
    let result = result_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(11, e))?;

    Ok(QueueItem {
        id,
        operation,
        priority,
        depends_on,
        status,
        attempts,
        created_at: from_db_time(&created_at_str),
        last_attempt_at: last_attempt_str.map(|s| from_db_time(&s)),
        next_eligible_at: next_eligible_str.map(|s| from_db_time(&s)),
        last_error,
        result,
        idempotency_key,
        origin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::sync::operation::VegetationIndexPayload;
    use chrono::Duration;
    use serde_json::json;

    fn create_test_queue() -> SyncQueue {
        SyncQueue::with_database(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn ndvi(plot: &str) -> Operation {
        Operation::VegetationIndexRequest(VegetationIndexPayload {
            plot_id: plot.to_string(),
            date: "2024-11-02".to_string(),
            index_type: "ndvi".to_string(),
        })
    }

    fn enqueue(queue: &SyncQueue, plot: &str, options: &EnqueueOptions) -> QueueItem {
        queue
            .insert(&ndvi(plot), options, Utc::now(), &format!("key-{plot}"))
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "p1", &EnqueueOptions::default());
        let loaded = queue.get(item.id).unwrap().unwrap();

        assert_eq!(loaded.kind(), OperationKind::VegetationIndexRequest);
        assert_eq!(loaded.status, QueueStatus::Pending);
        assert_eq!(loaded.operation, ndvi("p1"));
        assert_eq!(loaded.idempotency_key, "key-p1");
        assert_eq!(loaded.origin, "app");
    }

    #[test]
    fn test_ids_are_creation_ordered() {
        let queue = create_test_queue();

        let a = enqueue(&queue, "a", &EnqueueOptions::default());
        let b = enqueue(&queue, "b", &EnqueueOptions::default());
        assert!(b.id > a.id);
    }

    #[test]
    fn test_insert_rejects_unknown_dependency() {
        let queue = create_test_queue();

        let err = queue
            .insert(
                &ndvi("p1"),
                &EnqueueOptions::default().depends_on(99),
                Utc::now(),
                "k",
            )
            .unwrap_err();
        assert!(matches!(err, FieldsyncError::NotFound(_)));
        assert!(queue.list(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_insert_accepts_pruned_dependency() {
        let queue = create_test_queue();

        let parent = enqueue(&queue, "parent", &EnqueueOptions::default());
        assert!(queue.delete(parent.id).unwrap());

        let child = enqueue(&queue, "child", &EnqueueOptions::default().depends_on(parent.id));
        assert_eq!(child.depends_on, Some(parent.id));

        let err = queue
            .insert(
                &ndvi("p2"),
                &EnqueueOptions::default().depends_on(child.id + 1),
                Utc::now(),
                "k",
            )
            .unwrap_err();
        assert!(matches!(err, FieldsyncError::NotFound(_)));
    }

    #[test]
    fn test_due_orders_by_priority_then_age() {
        let queue = create_test_queue();

        let low = enqueue(&queue, "low", &EnqueueOptions::default().priority(5));
        let first = enqueue(&queue, "first", &EnqueueOptions::default().priority(1));
        let second = enqueue(&queue, "second", &EnqueueOptions::default().priority(1));

        let due: Vec<i64> = queue.due(Utc::now()).unwrap().iter().map(|i| i.id).collect();
        assert_eq!(due, vec![first.id, second.id, low.id]);
    }

    #[test]
    fn test_due_respects_backoff() {
        let queue = create_test_queue();
        let now = Utc::now();

        let item = enqueue(&queue, "p1", &EnqueueOptions::default());
        queue
            .record_failure(
                item.id,
                1,
                QueueStatus::Retrying,
                "HTTP 503",
                Some(now + Duration::seconds(5)),
            )
            .unwrap();

        assert!(queue.due(now).unwrap().is_empty());
        assert_eq!(queue.due(now + Duration::seconds(5)).unwrap().len(), 1);
        assert_eq!(
            queue.next_retry_at().unwrap(),
            Some(from_db_time(&to_db_time(now + Duration::seconds(5))))
        );
    }

    #[test]
    fn test_claim_is_conditional() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "p1", &EnqueueOptions::default());
        assert!(queue.claim(item.id, Utc::now()).unwrap());
        // Already syncing
        assert!(!queue.claim(item.id, Utc::now()).unwrap());
        assert_eq!(queue.status_of(item.id).unwrap(), Some(QueueStatus::Syncing));
    }

    #[test]
    fn test_mark_completed_stores_result() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "p1", &EnqueueOptions::default());
        queue.claim(item.id, Utc::now()).unwrap();
        queue
            .mark_completed(item.id, &json!({"ndvi": 0.72}), Utc::now())
            .unwrap();

        let loaded = queue.get(item.id).unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Completed);
        assert_eq!(loaded.result, Some(json!({"ndvi": 0.72})));
    }

    #[test]
    fn test_remove_cancellable() {
        let queue = create_test_queue();

        let pending = enqueue(&queue, "a", &EnqueueOptions::default());
        let syncing = enqueue(&queue, "b", &EnqueueOptions::default());
        queue.claim(syncing.id, Utc::now()).unwrap();

        assert_eq!(queue.remove_cancellable(pending.id).unwrap().id, pending.id);
        assert!(queue.get(pending.id).unwrap().is_none());

        let err = queue.remove_cancellable(syncing.id).unwrap_err();
        assert!(matches!(err, FieldsyncError::InvalidState(_)));

        let err = queue.remove_cancellable(12345).unwrap_err();
        assert!(matches!(err, FieldsyncError::NotFound(_)));
    }

    #[test]
    fn test_remove_cancellable_failed_item() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "a", &EnqueueOptions::default());
        queue
            .record_failure(item.id, 3, QueueStatus::Failed, "HTTP 500", None)
            .unwrap();

        assert!(queue.remove_cancellable(item.id).is_ok());
    }

    #[test]
    fn test_remove_cancellable_with_waiting_dependent() {
        let queue = create_test_queue();

        let parent = enqueue(&queue, "parent", &EnqueueOptions::default());
        let child = enqueue(&queue, "child", &EnqueueOptions::default().depends_on(parent.id));
        queue
            .record_failure(parent.id, 3, QueueStatus::Failed, "HTTP 500", None)
            .unwrap();

        let err = queue.remove_cancellable(parent.id).unwrap_err();
        assert!(matches!(err, FieldsyncError::InvalidState(_)));

        queue.remove_cancellable(child.id).unwrap();
        queue.remove_cancellable(parent.id).unwrap();
    }

    #[test]
    fn test_purge_keeps_failed_dependency() {
        let queue = create_test_queue();
        let later = Utc::now() + Duration::hours(1);

        let parent = enqueue(&queue, "parent", &EnqueueOptions::default());
        enqueue(&queue, "child", &EnqueueOptions::default().depends_on(parent.id));
        queue
            .record_failure(parent.id, 3, QueueStatus::Failed, "HTTP 500", None)
            .unwrap();

        assert_eq!(queue.purge_before(QueueStatus::Failed, later).unwrap(), 0);
        assert!(queue.get(parent.id).unwrap().is_some());
    }

    #[test]
    fn test_reset_failed() {
        let queue = create_test_queue();

        let a = enqueue(&queue, "a", &EnqueueOptions::default());
        let b = enqueue(&queue, "b", &EnqueueOptions::default());
        queue
            .record_failure(a.id, 3, QueueStatus::Failed, "boom", None)
            .unwrap();

        assert_eq!(queue.reset_failed().unwrap(), vec![a.id]);

        let loaded = queue.get(a.id).unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Pending);
        assert_eq!(loaded.attempts, 0);
        assert!(loaded.last_error.is_none());
        assert_eq!(queue.status_of(b.id).unwrap(), Some(QueueStatus::Pending));
    }

    #[test]
    fn test_reset_single_requires_failed() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "a", &EnqueueOptions::default());
        let err = queue.reset(item.id).unwrap_err();
        assert!(matches!(err, FieldsyncError::InvalidState(_)));

        queue
            .record_failure(item.id, 3, QueueStatus::Failed, "boom", None)
            .unwrap();
        queue.reset(item.id).unwrap();
        assert_eq!(queue.status_of(item.id).unwrap(), Some(QueueStatus::Pending));
    }

    #[test]
    fn test_recover_interrupted() {
        let queue = create_test_queue();

        let item = enqueue(&queue, "a", &EnqueueOptions::default());
        queue.claim(item.id, Utc::now()).unwrap();

        assert_eq!(queue.recover_interrupted().unwrap(), 1);
        assert_eq!(queue.status_of(item.id).unwrap(), Some(QueueStatus::Pending));
    }

    #[test]
    fn test_purge_before() {
        let queue = create_test_queue();
        let now = Utc::now();

        let done = enqueue(&queue, "a", &EnqueueOptions::default());
        queue
            .mark_completed(done.id, &json!({}), now - Duration::hours(48))
            .unwrap();
        let recent = enqueue(&queue, "b", &EnqueueOptions::default());
        queue.mark_completed(recent.id, &json!({}), now).unwrap();
        let waiting = enqueue(&queue, "c", &EnqueueOptions::default());

        let removed = queue
            .purge_before(QueueStatus::Completed, now - Duration::hours(24))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(queue
            .purge_before(QueueStatus::Pending, now + Duration::hours(1))
            .is_err());
        assert!(queue.get(done.id).unwrap().is_none());
        assert!(queue.get(recent.id).unwrap().is_some());
        assert!(queue.get(waiting.id).unwrap().is_some());
    }

    #[test]
    fn test_stats() {
        let queue = create_test_queue();

        let a = enqueue(&queue, "a", &EnqueueOptions::default());
        let b = enqueue(&queue, "b", &EnqueueOptions::default());
        enqueue(&queue, "c", &EnqueueOptions::default());
        queue.mark_completed(a.id, &json!({}), Utc::now()).unwrap();
        queue
            .record_failure(b.id, 1, QueueStatus::Retrying, "x", Some(Utc::now()))
            .unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.retrying, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.outstanding(), 2);
        assert!(stats.oldest_pending.is_some());
    }

    #[test]
    fn test_list_by_status() {
        let queue = create_test_queue();

        let a = enqueue(&queue, "a", &EnqueueOptions::default());
        enqueue(&queue, "b", &EnqueueOptions::default());
        queue
            .record_failure(a.id, 3, QueueStatus::Failed, "x", None)
            .unwrap();

        let failed = queue.list(Some(QueueStatus::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);
        assert_eq!(queue.list(None, 1).unwrap().len(), 1);
    }
}
