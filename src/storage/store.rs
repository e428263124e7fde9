//! Durable local store for offline read-cache records.
//!
//! Records are grouped into a closed set of [`Collection`]s and keyed by the
//! natural id of the entity they cache. Every write is committed before the
//! call returns. Queue items are not stored here; see
//! [`crate::features::sync::SyncQueue`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{from_db_time, to_db_time, Database};
use crate::error::FieldsyncError;

/// Name of the reserved collection that holds queue items.
pub const SYNC_QUEUE_COLLECTION: &str = "syncQueue";

/// Offline cache collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Plots keyed by plot id
    Plots,
    /// Vegetation index snapshots (NDVI, NDRE, MSAVI)
    VegetationIndices,
    /// Productivity estimates per plot and season
    Productivity,
    /// Weather and growing-degree-day data keyed by plot id
    Weather,
    /// Locally recorded field inspections
    Inspections,
    /// Locally recorded field operations
    FieldOperations,
    /// Raw API responses keyed by URL
    ApiCache,
}

impl Collection {
    /// All collections, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Plots,
        Self::VegetationIndices,
        Self::Productivity,
        Self::Weather,
        Self::Inspections,
        Self::FieldOperations,
        Self::ApiCache,
    ];

    /// Storage name of the collection.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plots => "plots",
            Self::VegetationIndices => "vegetation_indices",
            Self::Productivity => "productivity",
            Self::Weather => "weather",
            Self::Inspections => "inspections",
            Self::FieldOperations => "field_operations",
            Self::ApiCache => "api_cache",
        }
    }

    /// Secondary indexes declared for this collection.
    ///
    /// Each index names a top-level field of the cached JSON value.
    #[must_use]
    pub const fn indexes(self) -> &'static [&'static str] {
        match self {
            Self::Plots => &["farm_id"],
            Self::VegetationIndices => &["plot_id", "index_type"],
            Self::Productivity => &["plot_id", "season"],
            Self::Inspections | Self::FieldOperations => &["plot_id", "sync_status"],
            Self::Weather | Self::ApiCache => &[],
        }
    }

    /// Whether records in this collection are time series subject to pruning.
    #[must_use]
    pub const fn is_time_series(self) -> bool {
        matches!(
            self,
            Self::VegetationIndices | Self::Productivity | Self::Weather
        )
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = FieldsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == SYNC_QUEUE_COLLECTION {
            return Err(FieldsyncError::InvalidArgument(format!(
                "'{SYNC_QUEUE_COLLECTION}' is managed by the sync queue, not the cache"
            )));
        }
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| FieldsyncError::InvalidArgument(format!("Unknown collection: {s}")))
    }
}

/// A cached copy of a remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    /// Collection the record belongs to
    pub collection: Collection,
    /// Natural entity id
    pub key: String,
    /// Cached JSON value
    pub value: Value,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl CachedRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(collection: Collection, key: impl Into<String>, value: Value) -> Self {
        Self {
            collection,
            key: key.into(),
            value,
            updated_at: Utc::now(),
        }
    }
}

/// Durable key/value store over the `cached_records` and `sync_meta` tables.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
}

impl LocalStore {
    /// Create a store on top of a shared database.
    #[must_use]
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, record: &CachedRecord) -> Result<(), FieldsyncError> {
        let value = serde_json::to_string(&record.value)?;

        self.db
            .connection()
            .execute(
                r"INSERT INTO cached_records (collection, key, value, updated_at)
                  VALUES (?1, ?2, ?3, ?4)
                  ON CONFLICT(collection, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![
                    record.collection.name(),
                    record.key,
                    value,
                    to_db_time(record.updated_at),
                ],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to store record: {e}")))?;

        Ok(())
    }

    /// Store a value under `key`, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_value(
        &self,
        collection: Collection,
        key: &str,
        value: Value,
    ) -> Result<CachedRecord, FieldsyncError> {
        let record = CachedRecord::new(collection, key, value);
        self.put(&record)?;
        Ok(record)
    }

    /// Get a record by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<CachedRecord>, FieldsyncError> {
        self.db
            .connection()
            .query_row(
                r"SELECT key, value, updated_at FROM cached_records
                  WHERE collection = ?1 AND key = ?2",
                params![collection.name(), key],
                |row| row_to_record(collection, row),
            )
            .optional()
            .map_err(|e| FieldsyncError::Database(format!("Failed to read record: {e}")))
    }

    /// Get every record in a collection, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_all(&self, collection: Collection) -> Result<Vec<CachedRecord>, FieldsyncError> {
        let conn = self.db.connection();

        let mut stmt = conn
            .prepare(
                r"SELECT key, value, updated_at FROM cached_records
                  WHERE collection = ?1
                  ORDER BY key ASC",
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([collection.name()], |row| row_to_record(collection, row))
            .map_err(|e| FieldsyncError::Database(format!("Failed to query records: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| FieldsyncError::Database(e.to_string()))?);
        }

        Ok(records)
    }

    /// Get every record whose indexed field equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the index is not declared for the
    /// collection or the value is not a scalar, and a database error if the
    /// query fails.
    pub fn get_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &Value,
    ) -> Result<Vec<CachedRecord>, FieldsyncError> {
        if !collection.indexes().contains(&index) {
            return Err(FieldsyncError::InvalidArgument(format!(
                "Collection '{collection}' has no index '{index}'"
            )));
        }
        let needle = scalar_to_sql(value)?;
        let path = format!("$.{index}");

        let conn = self.db.connection();

        let mut stmt = conn
            .prepare(
                r"SELECT key, value, updated_at FROM cached_records
                  WHERE collection = ?1 AND json_extract(value, ?2) = ?3
                  ORDER BY key ASC",
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![collection.name(), path, needle], |row| {
                row_to_record(collection, row)
            })
            .map_err(|e| FieldsyncError::Database(format!("Failed to query index: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| FieldsyncError::Database(e.to_string()))?);
        }

        Ok(records)
    }

    /// Delete a record. Returns whether a record was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, collection: Collection, key: &str) -> Result<bool, FieldsyncError> {
        let rows = self
            .db
            .connection()
            .execute(
                "DELETE FROM cached_records WHERE collection = ?1 AND key = ?2",
                params![collection.name(), key],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to delete record: {e}")))?;

        Ok(rows > 0)
    }

    /// Remove records not updated within `max_age`. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_older_than(
        &self,
        collection: Collection,
        max_age: Duration,
    ) -> Result<usize, FieldsyncError> {
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(collection, cutoff)
    }

    /// Remove records last updated before `cutoff`. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_before(
        &self,
        collection: Collection,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, FieldsyncError> {
        let rows = self
            .db
            .connection()
            .execute(
                "DELETE FROM cached_records WHERE collection = ?1 AND updated_at < ?2",
                params![collection.name(), to_db_time(cutoff)],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to prune records: {e}")))?;

        Ok(rows)
    }

    /// Count records per collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn counts(&self) -> Result<Vec<(Collection, i64)>, FieldsyncError> {
        let conn = self.db.connection();
        let mut counts = Vec::with_capacity(Collection::ALL.len());

        for collection in Collection::ALL {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM cached_records WHERE collection = ?1",
                    [collection.name()],
                    |row| row.get(0),
                )
                .map_err(|e| FieldsyncError::Database(format!("Failed to count records: {e}")))?;
            counts.push((collection, count));
        }

        Ok(counts)
    }

    /// Read a bookkeeping value.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, FieldsyncError> {
        self.db
            .connection()
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| FieldsyncError::Database(format!("Failed to read {key}: {e}")))
    }

    /// Write a bookkeeping value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), FieldsyncError> {
        self.db
            .connection()
            .execute(
                r"INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                  ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| FieldsyncError::Database(format!("Failed to write {key}: {e}")))?;

        Ok(())
    }
}

fn scalar_to_sql(value: &Value) -> Result<SqlValue, FieldsyncError> {
    match value {
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .ok_or_else(|| FieldsyncError::InvalidArgument(format!("Unsupported number: {n}"))),
        Value::Null | Value::Array(_) | Value::Object(_) => Err(FieldsyncError::InvalidArgument(
            "Index lookups require a string, number or boolean".to_string(),
        )),
    }
}

fn row_to_record(collection: Collection, row: &Row<'_>) -> Result<CachedRecord, rusqlite::Error> {
    let key: String = row.get(0)?;
    let value_str: String = row.get(1)?;
    let updated_at_str: String = row.get(2)?;

    let value = serde_json::from_str(&value_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(CachedRecord {
        collection,
        key,
        value,
        updated_at: from_db_time(&updated_at_str),
    })
}
