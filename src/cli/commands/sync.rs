//! Sync queue command implementation.
//!
//! Handles sync queue management commands.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use super::Context;
use crate::cli::args::{EnqueueArgs, OutputFormat};
use crate::error::FieldsyncError;
use crate::features::sync::{
    EnqueueOptions, HealthProbe, Operation, OperationKind, PassOutcome, PassSummary, QueueStats,
    QueueStatus, SyncEngine, SyncEvent,
};
use crate::output::{
    format_cleanup_pretty, format_item, format_items, format_probe_pretty, format_run_pretty,
    format_status_pretty, to_json,
};
use crate::storage::Collection;

const WAIT_POLL: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct StatusReport {
    #[serde(flatten)]
    queue: QueueStats,
    last_sync: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct RunReport {
    online: bool,
    recovered: usize,
    outcome: PassOutcome,
    events: Vec<SyncEvent>,
}

/// Show queue status.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn status(ctx: &Context, format: OutputFormat) -> Result<String, FieldsyncError> {
    let engine = ctx.engine(false)?;
    let report = StatusReport {
        queue: engine.stats()?.queue,
        last_sync: engine.last_sync()?,
    };

    match format {
        OutputFormat::Json => to_json(&report),
        OutputFormat::Pretty => Ok(format_status_pretty(
            &report.queue,
            report.last_sync,
            Utc::now(),
        )),
    }
}

/// List queued items.
///
/// # Errors
///
/// Returns an error if the status filter is unknown or the store cannot be
/// read.
pub fn list(
    ctx: &Context,
    status: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    let status = status.map(QueueStatus::from_str).transpose()?;
    let items = ctx.engine(false)?.list(status, limit)?;

    let title = status.map_or_else(|| "Queue".to_string(), |s| format!("{s} items"));
    format_items(&items, &title, format)
}

/// Show one queued item.
///
/// # Errors
///
/// Returns an error if the item does not exist or the store cannot be read.
pub fn show(ctx: &Context, id: i64, format: OutputFormat) -> Result<String, FieldsyncError> {
    let item = ctx
        .engine(false)?
        .get(id)?
        .ok_or_else(|| FieldsyncError::NotFound(format!("Queue item {id}")))?;
    format_item(&item, format)
}

/// Queue an operation without delivering it.
///
/// # Errors
///
/// Returns an error if the type or payload is invalid, the dependency does
/// not exist or the store cannot be written.
pub fn enqueue(
    ctx: &Context,
    args: EnqueueArgs,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    let kind = OperationKind::from_str(&args.kind)?;
    let operation = Operation::from_parts(kind, &args.payload)?;

    let mut options = EnqueueOptions::default()
        .priority(args.priority)
        .origin(args.origin);
    if let Some(dep) = args.depends_on {
        options = options.depends_on(dep);
    }

    // Keep locally created records visible offline until the server accepts them
    match &operation {
        Operation::Inspection(p) => {
            ctx.cache()
                .record_local(Collection::Inspections, &p.local_id, serde_json::to_value(p)?)?;
        }
        Operation::FieldOperation(p) => {
            ctx.cache().record_local(
                Collection::FieldOperations,
                &p.local_id,
                serde_json::to_value(p)?,
            )?;
        }
        _ => {}
    }

    let item = ctx.engine(false)?.enqueue(operation, options)?;

    match format {
        OutputFormat::Json => to_json(&item),
        OutputFormat::Pretty => Ok(format!(
            "Queued {} (ID: {})",
            item.kind().display_name(),
            item.id
        )),
    }
}

/// Deliver queued items.
///
/// # Errors
///
/// Returns an error if the store fails during the pass.
pub async fn run(
    ctx: &Context,
    offline: bool,
    wait: bool,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    let online = !offline && ctx.probe_online().await?;
    let engine = ctx.engine(online)?;
    let events = record_events(&engine);

    let recovered = engine.start().await?;
    if wait && online {
        wait_until_idle(&engine).await;
    }
    engine.shutdown();

    let events = std::mem::take(&mut *events.lock());
    let outcome = if online {
        PassOutcome::Finished(summarize(&events))
    } else {
        PassOutcome::Offline
    };

    match format {
        OutputFormat::Json => to_json(&RunReport {
            online,
            recovered,
            outcome,
            events,
        }),
        OutputFormat::Pretty => {
            let mut output = String::new();
            if recovered > 0 {
                output.push_str(&format!("Recovered {recovered} interrupted items\n"));
            }
            output.push_str(&format_run_pretty(&events, &outcome));
            Ok(output)
        }
    }
}

/// Cancel a queued item.
///
/// # Errors
///
/// Returns an error if the item does not exist or can no longer be
/// cancelled.
pub fn cancel(ctx: &Context, id: i64, format: OutputFormat) -> Result<String, FieldsyncError> {
    let item = ctx.engine(false)?.cancel(id)?;

    match format {
        OutputFormat::Json => to_json(&json!({ "cancelled": item })),
        OutputFormat::Pretty => Ok(format!(
            "Cancelled {} (ID: {id})",
            item.kind().display_name()
        )),
    }
}

/// Reset failed items and deliver them.
///
/// # Errors
///
/// Returns an error if neither `--all` nor an id is given, the item cannot
/// be retried or the store fails.
pub async fn retry(
    ctx: &Context,
    all: bool,
    id: Option<i64>,
    format: OutputFormat,
) -> Result<String, FieldsyncError> {
    if !all && id.is_none() {
        return Err(FieldsyncError::InvalidArgument(
            "Specify --all or provide an item ID".to_string(),
        ));
    }

    let online = ctx.probe_online().await?;
    let engine = ctx.engine(online)?;
    let events = record_events(&engine);

    let reset = match id {
        Some(id) => {
            engine.retry(id).await?;
            1
        }
        None => engine.retry_failed().await?,
    };
    engine.shutdown();

    let events = std::mem::take(&mut *events.lock());
    let outcome = if online {
        PassOutcome::Finished(summarize(&events))
    } else {
        PassOutcome::Offline
    };

    match format {
        OutputFormat::Json => to_json(&json!({ "reset": reset, "outcome": outcome })),
        OutputFormat::Pretty => Ok(format!(
            "Reset {reset} failed items for retry\n{}",
            format_run_pretty(&events, &outcome)
        )),
    }
}

/// Remove completed and failed items past their retention window.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn cleanup(ctx: &Context, format: OutputFormat) -> Result<String, FieldsyncError> {
    let report = ctx.engine(false)?.cleanup()?;

    match format {
        OutputFormat::Json => to_json(&report),
        OutputFormat::Pretty => Ok(format_cleanup_pretty(&report)),
    }
}

/// Probe the server.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub async fn probe(ctx: &Context, format: OutputFormat) -> Result<String, FieldsyncError> {
    let report = HealthProbe::new(&ctx.config.server)?.probe().await;

    match format {
        OutputFormat::Json => to_json(&report),
        OutputFormat::Pretty => Ok(format_probe_pretty(&report)),
    }
}

fn record_events(engine: &SyncEngine) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.subscribe(Arc::new(move |event: &SyncEvent| {
        sink.lock().push(event.clone());
    }));
    events
}

/// Poll until nothing is running or scheduled.
///
/// Idleness must hold on two consecutive polls, since a finishing pass
/// releases its flag just before scheduling its follow-up.
async fn wait_until_idle(engine: &SyncEngine) {
    let mut idle_polls = 0;
    while idle_polls < 2 {
        tokio::time::sleep(WAIT_POLL).await;
        if engine.is_idle() {
            idle_polls += 1;
        } else {
            idle_polls = 0;
        }
    }
}

/// Item outcomes over every pass in `events`.
///
/// Held-back items are counted again by each pass, so skips and interruption
/// come from the last pass only.
fn summarize(events: &[SyncEvent]) -> PassSummary {
    let mut total = PassSummary::default();
    for event in events {
        if let SyncEvent::Completed { summary, .. } = event {
            total.attempted += summary.attempted;
            total.succeeded += summary.succeeded;
            total.retried += summary.retried;
            total.failed += summary.failed;
            total.skipped = summary.skipped;
            total.interrupted = summary.interrupted;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Paths};
    use crate::storage::Database;
    use serde_json::Value;
    use tempfile::TempDir;

    fn create_context() -> (TempDir, Context) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_root(dir.path().to_path_buf());
        let ctx = Context::with_database(
            paths,
            Config::default(),
            Arc::new(Database::open_in_memory().unwrap()),
        );
        (dir, ctx)
    }

    fn enqueue_args(kind: &str, payload: &str) -> EnqueueArgs {
        EnqueueArgs {
            kind: kind.to_string(),
            payload: payload.to_string(),
            priority: 1,
            depends_on: None,
            origin: "cli".to_string(),
        }
    }

    #[test]
    fn test_enqueue_and_list() {
        let (_dir, ctx) = create_context();

        let output = enqueue(
            &ctx,
            enqueue_args("plot-update", r#"{"id":"p1","crop":"soy"}"#),
            OutputFormat::Pretty,
        )
        .unwrap();
        assert!(output.contains("Queued Plot Update (ID: 1)"));

        let listed = list(&ctx, Some("pending"), 20, OutputFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(parsed["count"], 1);
        assert_eq!(parsed["items"][0]["operation"]["payload"]["crop"], "soy");
    }

    #[test]
    fn test_enqueue_inspection_is_cached_locally() {
        let (_dir, ctx) = create_context();
        let payload = r#"{"local_id":"local-1","plot_id":"p1","farm_id":"f1",
            "category":"pest","title":"Aphids","severity":"high"}"#;

        enqueue(&ctx, enqueue_args("inspection", payload), OutputFormat::Json).unwrap();

        let record = ctx
            .cache()
            .store()
            .get(Collection::Inspections, "local-1")
            .unwrap()
            .unwrap();
        assert_eq!(record.value["sync_status"], "pending");
        assert_eq!(record.value["title"], "Aphids");
    }

    #[test]
    fn test_enqueue_rejects_bad_input() {
        let (_dir, ctx) = create_context();

        let unknown = enqueue(&ctx, enqueue_args("teleport", "{}"), OutputFormat::Json);
        assert!(matches!(unknown, Err(FieldsyncError::InvalidArgument(_))));

        let missing_id = enqueue(
            &ctx,
            enqueue_args("plot-update", r#"{"crop":"soy"}"#),
            OutputFormat::Json,
        );
        assert!(matches!(missing_id, Err(FieldsyncError::Parse(_))));
    }

    #[test]
    fn test_show() {
        let (_dir, ctx) = create_context();
        enqueue(
            &ctx,
            enqueue_args("farm-update", r#"{"id":"f1"}"#),
            OutputFormat::Json,
        )
        .unwrap();

        let output = show(&ctx, 1, OutputFormat::Pretty).unwrap();
        assert!(output.contains("Farm Update"));
        assert!(matches!(
            show(&ctx, 2, OutputFormat::Pretty),
            Err(FieldsyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_rejects_unknown_status() {
        let (_dir, ctx) = create_context();
        assert!(list(&ctx, Some("lost"), 20, OutputFormat::Json).is_err());
    }

    #[test]
    fn test_status_json() {
        let (_dir, ctx) = create_context();
        enqueue(
            &ctx,
            enqueue_args("farm-update", r#"{"id":"f1"}"#),
            OutputFormat::Json,
        )
        .unwrap();

        let output = status(&ctx, OutputFormat::Json).unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["pending"], 1);
        assert_eq!(parsed["failed"], 0);
        assert!(parsed["last_sync"].is_null());
    }

    #[test]
    fn test_cancel() {
        let (_dir, ctx) = create_context();
        enqueue(
            &ctx,
            enqueue_args("farm-update", r#"{"id":"f1"}"#),
            OutputFormat::Json,
        )
        .unwrap();

        let output = cancel(&ctx, 1, OutputFormat::Pretty).unwrap();
        assert!(output.contains("Cancelled Farm Update"));
        assert!(matches!(
            cancel(&ctx, 1, OutputFormat::Pretty),
            Err(FieldsyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_offline_keeps_items() {
        let (_dir, ctx) = create_context();
        enqueue(
            &ctx,
            enqueue_args("farm-update", r#"{"id":"f1"}"#),
            OutputFormat::Json,
        )
        .unwrap();

        let output = run(&ctx, true, false, OutputFormat::Json).await.unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["online"], false);
        assert_eq!(parsed["outcome"]["outcome"], "offline");
        let listed = list(&ctx, Some("pending"), 20, OutputFormat::Json).unwrap();
        assert!(listed.contains("\"count\": 1"));
    }

    #[tokio::test]
    async fn test_retry_requires_target() {
        let (_dir, ctx) = create_context();
        let result = retry(&ctx, false, None, OutputFormat::Json).await;
        assert!(matches!(result, Err(FieldsyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_summarize() {
        let events = vec![
            SyncEvent::ItemStart {
                id: 1,
                kind: OperationKind::FarmUpdate,
            },
            SyncEvent::Completed {
                at: Utc::now(),
                summary: PassSummary {
                    attempted: 2,
                    succeeded: 1,
                    failed: 1,
                    skipped: 1,
                    ..PassSummary::default()
                },
            },
            SyncEvent::Completed {
                at: Utc::now(),
                summary: PassSummary {
                    attempted: 1,
                    retried: 1,
                    skipped: 1,
                    ..PassSummary::default()
                },
            },
        ];

        let summary = summarize(&events);

        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.interrupted);
    }
}
