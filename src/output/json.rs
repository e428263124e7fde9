//! JSON output formatting for fieldsync.
//!
//! This module provides functions for formatting queue and cache data as JSON.

use serde::Serialize;
use serde_json::json;

use crate::error::FieldsyncError;
use crate::features::sync::QueueItem;
use crate::storage::{CachedRecord, Collection};

/// Format queue items as JSON
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn format_items_json(items: &[QueueItem], list_name: &str) -> Result<String, FieldsyncError> {
    let output = json!({
        "list": list_name,
        "count": items.len(),
        "items": items
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format cached records as JSON
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn format_records_json(
    records: &[CachedRecord],
    collection: Collection,
) -> Result<String, FieldsyncError> {
    let output = json!({
        "collection": collection.name(),
        "count": records.len(),
        "items": records
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Generic JSON formatter for any serializable type
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, FieldsyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}
