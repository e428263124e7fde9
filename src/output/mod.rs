//! Output formatting for fieldsync.
//!
//! This module provides formatters for displaying queue and cache data in
//! various formats.

mod json;
mod pretty;

use crate::cli::args::OutputFormat;
use crate::error::FieldsyncError;
use crate::features::sync::QueueItem;
use crate::storage::{CachedRecord, Collection};

pub use json::*;
pub use pretty::*;

/// Format queue items based on output format
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn format_items(
    items: &[QueueItem],
    title: &str,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_items_pretty(items, title)),
        OutputFormat::Json => format_items_json(items, title),
    }
}

/// Format a single queue item based on output format
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn format_item(item: &QueueItem, format: OutputFormat) -> Result<String, FieldsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_item_pretty(item)),
        OutputFormat::Json => to_json(item),
    }
}

/// Format cached records based on output format
///
/// # Errors
///
/// Returns `FieldsyncError::Parse` if JSON serialization fails.
pub fn format_records(
    records: &[CachedRecord],
    collection: Collection,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_records_pretty(records, collection)),
        OutputFormat::Json => format_records_json(records, collection),
    }
}
