//! Storage layer for fieldsync.
//!
//! This module provides SQLite-based persistence for:
//! - The offline mutation queue
//! - The offline read cache (plots, indices, weather, ...)
//! - Sync bookkeeping

mod database;
mod migrations;
mod store;

use chrono::{DateTime, SecondsFormat, Utc};

pub use database::Database;
pub use store::{CachedRecord, Collection, LocalStore, SYNC_QUEUE_COLLECTION};

/// Format a timestamp for storage.
///
/// All stored timestamps share this fixed-width UTC format so that SQL string
/// comparison orders them chronologically.
pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to the Unix epoch on corrupt data.
pub(crate) fn from_db_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or(DateTime::UNIX_EPOCH, |t| t.with_timezone(&Utc))
}
