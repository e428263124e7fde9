//! Offline cache command implementation.

use std::str::FromStr;

use serde_json::json;

use super::Context;
use crate::cli::args::{CacheCommands, OutputFormat};
use crate::error::FieldsyncError;
use crate::output::{format_availability_pretty, format_records, to_json};
use crate::storage::Collection;

/// Execute cache subcommands.
///
/// # Errors
///
/// Returns an error if the collection is unknown, a record does not exist
/// or the store fails.
pub fn cache(
    ctx: &Context,
    cmd: CacheCommands,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    let cache = ctx.cache();

    match cmd {
        CacheCommands::Prune { days } => {
            let days = days.unwrap_or(ctx.config.cache.max_age_days);
            let removed = cache.prune_stale(days)?;

            match format {
                OutputFormat::Json => to_json(&json!({ "removed": removed, "days": days })),
                OutputFormat::Pretty => Ok(format!(
                    "Removed {removed} cached records older than {days} days"
                )),
            }
        }
        CacheCommands::Show { collection, key } => {
            let collection = Collection::from_str(&collection)?;
            let records = match key {
                Some(key) => {
                    let record = cache.store().get(collection, &key)?.ok_or_else(|| {
                        FieldsyncError::NotFound(format!("{collection} record {key}"))
                    })?;
                    vec![record]
                }
                None => cache.store().get_all(collection)?,
            };
            format_records(&records, collection, format)
        }
        CacheCommands::Availability { plot_id } => {
            let availability = cache.offline_availability(&plot_id)?;

            match format {
                OutputFormat::Json => to_json(&availability),
                OutputFormat::Pretty => Ok(format_availability_pretty(&availability)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Paths};
    use crate::storage::Database;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_context() -> (TempDir, Context) {
        let dir = TempDir::new().unwrap();
        let ctx = Context::with_database(
            Paths::with_root(dir.path().to_path_buf()),
            Config::default(),
            Arc::new(Database::open_in_memory().unwrap()),
        );
        (dir, ctx)
    }

    #[test]
    fn test_show_collection() {
        let (_dir, ctx) = create_context();
        ctx.cache()
            .save_plot("p1", json!({ "id": "p1", "farm_id": "f1" }))
            .unwrap();

        let output = cache(
            &ctx,
            CacheCommands::Show {
                collection: "plots".to_string(),
                key: None,
            },
            OutputFormat::Json,
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["items"][0]["value"]["farm_id"], "f1");
    }

    #[test]
    fn test_show_missing_record() {
        let (_dir, ctx) = create_context();
        let result = cache(
            &ctx,
            CacheCommands::Show {
                collection: "weather".to_string(),
                key: Some("p9".to_string()),
            },
            OutputFormat::Pretty,
        );
        assert!(matches!(result, Err(FieldsyncError::NotFound(_))));
    }

    #[test]
    fn test_show_refuses_queue_collection() {
        let (_dir, ctx) = create_context();
        let result = cache(
            &ctx,
            CacheCommands::Show {
                collection: "syncQueue".to_string(),
                key: None,
            },
            OutputFormat::Pretty,
        );
        assert!(matches!(result, Err(FieldsyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_prune_uses_configured_age() {
        let (_dir, ctx) = create_context();
        let output = cache(&ctx, CacheCommands::Prune { days: None }, OutputFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["days"], 30);
        assert_eq!(parsed["removed"], 0);
    }

    #[test]
    fn test_availability() {
        let (_dir, ctx) = create_context();
        ctx.cache().save_weather("p1", json!({ "gdd": 812 })).unwrap();

        let output = cache(
            &ctx,
            CacheCommands::Availability {
                plot_id: "p1".to_string(),
            },
            OutputFormat::Json,
        )
        .unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["has_weather"], true);
        assert_eq!(parsed["has_plot"], false);
    }
}
