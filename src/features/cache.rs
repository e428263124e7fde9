//! Domain helpers over the offline read cache.
//!
//! Wraps [`LocalStore`] with the key layout and bookkeeping fields used for
//! plots, vegetation indices, productivity, weather and locally recorded
//! inspections and field operations.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::FieldsyncError;
use crate::storage::{CachedRecord, Collection, LocalStore};

/// Hours a cached API response stays fresh.
pub const API_CACHE_TTL_HOURS: i64 = 24;

/// `sync_status` of a locally recorded entity not yet accepted by the server.
pub const SYNC_STATUS_PENDING: &str = "pending";

/// `sync_status` of a locally recorded entity accepted by the server.
pub const SYNC_STATUS_SYNCED: &str = "synced";

/// What is available offline for one plot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineAvailability {
    pub plot_id: String,
    pub has_plot: bool,
    pub has_vegetation_indices: bool,
    pub has_productivity: bool,
    pub has_weather: bool,
    /// Most recent update across the cached time series
    pub last_updated: Option<DateTime<Utc>>,
}

/// Domain-level view of the offline cache.
#[derive(Clone)]
pub struct FieldCache {
    store: LocalStore,
}

impl FieldCache {
    /// Wrap a store.
    #[must_use]
    pub const fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Cache a plot as returned by the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_plot(&self, plot_id: &str, plot: Value) -> Result<CachedRecord, FieldsyncError> {
        self.store.put_value(Collection::Plots, plot_id, plot)
    }

    /// Merge local edits into the cached copy of a plot.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn merge_plot(
        &self,
        plot_id: &str,
        changes: &Map<String, Value>,
    ) -> Result<CachedRecord, FieldsyncError> {
        let mut value = self
            .store
            .get(Collection::Plots, plot_id)?
            .map_or_else(|| json!({ "id": plot_id }), |r| r.value);
        merge_into(&mut value, changes);
        self.save_plot(plot_id, value)
    }

    /// Cached plots of a farm.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn plots_for_farm(&self, farm_id: &str) -> Result<Vec<CachedRecord>, FieldsyncError> {
        self.store
            .get_by_index(Collection::Plots, "farm_id", &json!(farm_id))
    }

    /// Cache a vegetation index snapshot.
    ///
    /// The record is keyed by plot, index and date, and carries those fields
    /// so the collection indexes can find it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_vegetation_index(
        &self,
        plot_id: &str,
        index_type: &str,
        date: &str,
        data: Value,
    ) -> Result<CachedRecord, FieldsyncError> {
        let mut value = object_or_wrapped(data);
        merge_into(
            &mut value,
            &fields([
                ("plot_id", json!(plot_id)),
                ("index_type", json!(index_type)),
                ("date", json!(date)),
            ]),
        );
        let key = format!("{plot_id}:{index_type}:{date}");
        self.store.put_value(Collection::VegetationIndices, &key, value)
    }

    /// Cached vegetation indices of a plot, newest date first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn vegetation_indices(
        &self,
        plot_id: &str,
        index_type: Option<&str>,
    ) -> Result<Vec<CachedRecord>, FieldsyncError> {
        let mut records = self.store.get_by_index(
            Collection::VegetationIndices,
            "plot_id",
            &json!(plot_id),
        )?;

        if let Some(kind) = index_type {
            records.retain(|r| r.value.get("index_type").and_then(Value::as_str) == Some(kind));
        }
        records.sort_by(|a, b| {
            let date = |r: &CachedRecord| {
                r.value
                    .get("date")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            date(b).cmp(&date(a))
        });

        Ok(records)
    }

    /// Cache a productivity estimate for a plot and season.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_productivity(
        &self,
        plot_id: &str,
        season: &str,
        data: Value,
    ) -> Result<CachedRecord, FieldsyncError> {
        let mut value = object_or_wrapped(data);
        merge_into(
            &mut value,
            &fields([("plot_id", json!(plot_id)), ("season", json!(season))]),
        );
        self.store
            .put_value(Collection::Productivity, &format!("{plot_id}:{season}"), value)
    }

    /// Cache weather data for a plot.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_weather(&self, plot_id: &str, data: Value) -> Result<CachedRecord, FieldsyncError> {
        self.store.put_value(Collection::Weather, plot_id, data)
    }

    /// Store an entity created offline, marked as pending sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn record_local(
        &self,
        collection: Collection,
        local_id: &str,
        data: Value,
    ) -> Result<CachedRecord, FieldsyncError> {
        let mut value = object_or_wrapped(data);
        merge_into(
            &mut value,
            &fields([
                ("local_id", json!(local_id)),
                ("sync_status", json!(SYNC_STATUS_PENDING)),
            ]),
        );
        self.store.put_value(collection, local_id, value)
    }

    /// Mark a locally created entity as accepted by the server.
    ///
    /// Merges the server-assigned id into the cached copy. Creates the record
    /// if the local copy is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub fn mark_synced(
        &self,
        collection: Collection,
        local_id: &str,
        server: &Value,
    ) -> Result<CachedRecord, FieldsyncError> {
        let mut value = self
            .store
            .get(collection, local_id)?
            .map_or_else(|| json!({ "local_id": local_id }), |r| r.value);

        let mut update = fields([
            ("sync_status", json!(SYNC_STATUS_SYNCED)),
            ("synced_at", json!(Utc::now())),
        ]);
        if let Some(server_id) = server.get("id") {
            update.insert("server_id".to_string(), server_id.clone());
        }
        merge_into(&mut value, &update);

        debug!(%collection, local_id, "Reconciled cached record");
        self.store.put_value(collection, local_id, value)
    }

    /// Locally recorded entities still waiting for the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn unsynced(&self, collection: Collection) -> Result<Vec<CachedRecord>, FieldsyncError> {
        self.store
            .get_by_index(collection, "sync_status", &json!(SYNC_STATUS_PENDING))
    }

    /// Report which data of a plot is available offline.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn offline_availability(
        &self,
        plot_id: &str,
    ) -> Result<OfflineAvailability, FieldsyncError> {
        let indices = self.vegetation_indices(plot_id, None)?;
        let productivity =
            self.store
                .get_by_index(Collection::Productivity, "plot_id", &json!(plot_id))?;
        let weather = self.store.get(Collection::Weather, plot_id)?;

        let last_updated = indices
            .iter()
            .chain(productivity.iter())
            .chain(weather.iter())
            .map(|r| r.updated_at)
            .max();

        Ok(OfflineAvailability {
            plot_id: plot_id.to_string(),
            has_plot: self.store.get(Collection::Plots, plot_id)?.is_some(),
            has_vegetation_indices: !indices.is_empty(),
            has_productivity: !productivity.is_empty(),
            has_weather: weather.is_some(),
            last_updated,
        })
    }

    /// Remove time-series records older than `days` and expired API
    /// responses. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub fn prune_stale(&self, days: u32) -> Result<usize, FieldsyncError> {
        let max_age = Duration::days(i64::from(days));
        let mut removed = 0;

        for collection in Collection::ALL.into_iter().filter(|c| c.is_time_series()) {
            removed += self.store.prune_older_than(collection, max_age)?;
        }
        removed += self
            .store
            .prune_older_than(Collection::ApiCache, Duration::hours(API_CACHE_TTL_HOURS))?;

        debug!(days, removed, "Pruned stale cache records");
        Ok(removed)
    }

    /// Cache a raw API response.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn cache_api_response(&self, url: &str, response: Value) -> Result<(), FieldsyncError> {
        self.store.put_value(Collection::ApiCache, url, response)?;
        Ok(())
    }

    /// A cached API response younger than the TTL. Expired entries are
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or delete fails.
    pub fn cached_api_response(&self, url: &str) -> Result<Option<Value>, FieldsyncError> {
        let Some(record) = self.store.get(Collection::ApiCache, url)? else {
            return Ok(None);
        };

        if Utc::now() - record.updated_at > Duration::hours(API_CACHE_TTL_HOURS) {
            self.store.delete(Collection::ApiCache, url)?;
            return Ok(None);
        }

        Ok(Some(record.value))
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn object_or_wrapped(data: Value) -> Value {
    if data.is_object() {
        data
    } else {
        json!({ "data": data })
    }
}

fn merge_into(target: &mut Value, changes: &Map<String, Value>) {
    if let Value::Object(map) = target {
        for (k, v) in changes {
            map.insert(k.clone(), v.clone());
        }
    }
}
