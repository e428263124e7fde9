use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};

use crate::features::cache::OfflineAvailability;
use crate::features::sync::{
    CleanupReport, ConnectionQuality, PassOutcome, ProbeReport, QueueItem, QueueStats,
    QueueStatus, SyncEvent,
};
use crate::storage::{CachedRecord, Collection};

const ERROR_WIDTH: usize = 50;

fn status_icon(status: QueueStatus) -> ColoredString {
    match status {
        QueueStatus::Pending => "○".white(),
        QueueStatus::Syncing => "▸".cyan(),
        QueueStatus::Retrying => "↻".yellow(),
        QueueStatus::Completed => "✓".green(),
        QueueStatus::Failed => "✗".red(),
    }
}

/// Shorten text to `width` characters, marking the cut with an ellipsis.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Describe how long ago `then` was, relative to `now`.
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(then);
    if age.num_days() > 0 {
        format!("{} days ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}

/// Format queue items as a table
pub fn format_items_pretty(items: &[QueueItem], title: &str) -> String {
    if items.is_empty() {
        return format!("{title} (0 items)\n  No items");
    }

    let mut lines = vec![format!("{title} ({} items)", items.len()), "─".repeat(72)];
    lines.push(format!(
        "{:<6} {:<18} {:<4} {:<6} {:<17} {}",
        "ID", "Type", "Pri", "After", "Created", "Status"
    ));
    lines.push("─".repeat(72));

    for item in items {
        let after = item.depends_on.map(|d| d.to_string()).unwrap_or_default();
        let mut status = format!("{} {}", status_icon(item.status), item.status);
        if item.attempts > 0 {
            status.push_str(&format!(" ({} attempts)", item.attempts).dimmed().to_string());
        }

        lines.push(format!(
            "{:<6} {:<18} {:<4} {:<6} {:<17} {}",
            item.id,
            item.kind().display_name(),
            item.priority,
            after,
            item.created_at.format("%Y-%m-%d %H:%M"),
            status
        ));

        if let Some(error) = &item.last_error {
            lines.push(format!("       {}", truncate(error, ERROR_WIDTH).red()));
        }
    }

    lines.join("\n")
}

/// Format one queue item with all its fields
pub fn format_item_pretty(item: &QueueItem) -> String {
    let mut output = format!(
        "{} {} {}\n",
        status_icon(item.status),
        item.kind().display_name().bold(),
        format!("#{}", item.id).dimmed()
    );
    output.push_str(&format!("  {}: {}\n", "Status".dimmed(), item.status));
    if let Some(target) = item.operation.target_id() {
        output.push_str(&format!("  {}: {}\n", "Target".dimmed(), target));
    }
    output.push_str(&format!("  {}: {}\n", "Priority".dimmed(), item.priority));
    if let Some(dep) = item.depends_on {
        output.push_str(&format!("  {}: #{}\n", "After".dimmed(), dep));
    }
    output.push_str(&format!("  {}: {}\n", "Attempts".dimmed(), item.attempts));
    if let Some(next) = item.next_eligible_at {
        output.push_str(&format!(
            "  {}: {}\n",
            "Next retry".dimmed(),
            next.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    if let Some(error) = &item.last_error {
        output.push_str(&format!("  {}: {}\n", "Error".dimmed(), error.red()));
    }
    output.push_str(&format!("  {}: {}\n", "Origin".dimmed(), item.origin));
    output.push_str(&format!("  {}: {}\n", "Key".dimmed(), item.idempotency_key));
    output.push_str(&format!(
        "  {}: {}\n",
        "Created".dimmed(),
        item.created_at.format("%Y-%m-%d %H:%M")
    ));

    output
}

/// Format queue counters
pub fn format_status_pretty(
    stats: &QueueStats,
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    let mut lines = vec!["Sync Queue Status".bold().to_string(), "─".repeat(40)];

    lines.push(format!(
        "  Pending:    {} {}",
        stats.pending,
        if stats.pending > 0 {
            "waiting for delivery".dimmed()
        } else {
            "".dimmed()
        }
    ));
    if stats.syncing > 0 {
        lines.push(format!(
            "  Syncing:    {} {}",
            stats.syncing,
            "interrupted or in flight".yellow()
        ));
    }
    lines.push(format!(
        "  Retrying:   {} {}",
        stats.retrying,
        if stats.retrying > 0 {
            "waiting for backoff".yellow()
        } else {
            "".normal()
        }
    ));
    lines.push(format!("  Completed:  {}", stats.completed));
    lines.push(format!(
        "  Failed:     {} {}",
        stats.failed,
        if stats.failed > 0 {
            "need attention".red()
        } else {
            "".normal()
        }
    ));

    if let Some(oldest) = stats.oldest_pending {
        lines.push(format!("  Oldest:     {}", format_age(oldest, now).dimmed()));
    }
    lines.push(format!(
        "  Last sync:  {}",
        last_sync.map_or_else(|| "never".to_string(), |t| format_age(t, now))
    ));

    if stats.outstanding() > 0 {
        lines.push(String::new());
        lines.push(
            "Run 'fieldsync run' to deliver queued items"
                .dimmed()
                .to_string(),
        );
    }
    if stats.failed > 0 {
        lines.push(
            "Run 'fieldsync retry --all' to retry failed items"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Format the events of a run followed by its outcome
pub fn format_run_pretty(events: &[SyncEvent], outcome: &PassOutcome) -> String {
    let mut lines = Vec::new();

    for event in events {
        match event {
            SyncEvent::ItemSuccess { id, .. } => {
                lines.push(format!("  {} #{id} delivered", "✓".green()));
            }
            SyncEvent::ItemRetry {
                id,
                attempt,
                delay,
                error,
            } => lines.push(format!(
                "  {} #{id} attempt {attempt} failed, retrying in {}s: {}",
                "↻".yellow(),
                delay.as_secs(),
                truncate(error, ERROR_WIDTH).dimmed()
            )),
            SyncEvent::ItemFailed {
                id,
                attempts,
                error,
            } => lines.push(format!(
                "  {} #{id} failed after {attempts} attempts: {}",
                "✗".red(),
                truncate(error, ERROR_WIDTH).red()
            )),
            SyncEvent::Error { message } => {
                lines.push(format!("  {} {}", "!".red().bold(), message.red()));
            }
            _ => {}
        }
    }

    let summary = match outcome {
        PassOutcome::Offline => "Offline: queued items were kept for later.".yellow().to_string(),
        PassOutcome::AlreadyRunning => "Another sync pass is already running.".to_string(),
        PassOutcome::Finished(s) if s.interrupted => {
            "Connection lost: sync pass stopped early.".yellow().to_string()
        }
        PassOutcome::Finished(s) if s.attempted == 0 && s.skipped == 0 => {
            "No queued items to sync.".to_string()
        }
        PassOutcome::Finished(s) => {
            let mut text = format!(
                "Sync pass: {} delivered, {} retrying, {} failed",
                s.succeeded, s.retried, s.failed
            );
            if s.skipped > 0 {
                text.push_str(&format!(", {} waiting on dependencies", s.skipped));
            }
            text
        }
    };

    if lines.is_empty() {
        summary
    } else {
        lines.push(summary);
        lines.join("\n")
    }
}

/// Format a cleanup result
pub fn format_cleanup_pretty(report: &CleanupReport) -> String {
    if report.total() == 0 {
        return "Nothing to clean up.".to_string();
    }
    format!(
        "Removed {} completed and {} failed items",
        report.completed, report.failed
    )
}

/// Format cached records
pub fn format_records_pretty(records: &[CachedRecord], collection: Collection) -> String {
    if records.is_empty() {
        return format!("{collection} (0 records)\n  No records");
    }

    let mut output = format!("{collection} ({} records)\n", records.len());
    output.push_str(&"─".repeat(60));
    output.push('\n');

    for record in records {
        output.push_str(&format!(
            "{}  {}\n",
            record.key.bold(),
            record.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        ));
        let value = record.value.to_string();
        output.push_str(&format!("  {}\n", truncate(&value, 100)));
    }

    output
}

/// Format a plot's offline availability
pub fn format_availability_pretty(availability: &OfflineAvailability) -> String {
    let mark = |present: bool| if present { "✓".green() } else { "✗".red() };

    let mut lines = vec![
        format!("Offline data for plot {}", availability.plot_id.bold()),
        "─".repeat(40),
        format!("  {} Plot", mark(availability.has_plot)),
        format!("  {} Vegetation indices", mark(availability.has_vegetation_indices)),
        format!("  {} Productivity", mark(availability.has_productivity)),
        format!("  {} Weather", mark(availability.has_weather)),
    ];
    if let Some(updated) = availability.last_updated {
        lines.push(format!(
            "  Updated:   {}",
            updated.format("%Y-%m-%d %H:%M").to_string().dimmed()
        ));
    }

    lines.join("\n")
}

/// Format a health probe result
pub fn format_probe_pretty(report: &ProbeReport) -> String {
    let quality = match report.quality {
        ConnectionQuality::Excellent | ConnectionQuality::Good => {
            report.quality.as_str().green()
        }
        ConnectionQuality::Fair => report.quality.as_str().yellow(),
        ConnectionQuality::Poor | ConnectionQuality::Offline => report.quality.as_str().red(),
    };

    let mut line = format!("{} {}", quality.bold(), report.url.dimmed());
    if let Some(status) = report.status {
        line.push_str(&format!("  HTTP {status}"));
    }
    if let Some(ms) = report.latency_ms {
        line.push_str(&format!("  {ms} ms"));
    }
    line
}
