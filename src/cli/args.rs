use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::config::HOME_ENV;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Offline sync queue for field operators")]
#[command(long_about = "fieldsync - offline sync queue for field operators

Records inspections, field operations and plot edits while offline and
delivers them to the farm-management API once a connection is available.
Queued work survives restarts; failed deliveries are retried with backoff.

QUICK START:
  fieldsync enqueue --type plot-update --payload '{\"id\":\"p1\",\"crop\":\"soy\"}'
  fieldsync status             Show queue counters
  fieldsync run --wait         Deliver queued work, waiting out retries
  fieldsync list -s failed     Show items that ran out of retries

OUTPUT FORMATS:
  --output pretty    Human-readable colored output (default)
  --output json      Machine-readable JSON for scripting

For more information on a specific command, run:
  fieldsync <command> --help")]
#[command(version, propagate_version = true)]
pub struct Cli {
    /// Output format for command results
    ///
    /// Use 'pretty' for human-readable colored output,
    /// or 'json' for machine-readable output suitable for scripting.
    /// Defaults to `general.default_output` from the config file.
    #[arg(short, long, value_enum, global = true)]
    pub output: Option<OutputFormat>,

    /// Data directory holding config.yaml and the queue database
    #[arg(long, global = true, env = HOME_ENV)]
    pub home: Option<PathBuf>,

    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for command results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable colored output.
    #[default]
    Pretty,
    /// Machine-readable JSON output.
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show sync queue status
    ///
    /// Displays how many items are pending, syncing, retrying, completed
    /// and failed, the age of the oldest waiting item and the time of the
    /// last completed sync pass.
    ///
    /// # Examples
    ///
    ///   fieldsync status
    ///   fieldsync status -o json
    #[command(alias = "st")]
    Status,

    /// List queued items
    ///
    /// Items are shown oldest first, with their priority, dependency,
    /// attempt count and last error.
    ///
    /// # Examples
    ///
    ///   fieldsync list                 All items
    ///   fieldsync list -s retrying     Only items waiting for a retry
    ///   fieldsync list -n 5 -o json
    #[command(alias = "ls")]
    List {
        /// Filter by status (pending, syncing, retrying, completed, failed)
        #[arg(long, short = 's')]
        status: Option<String>,

        /// Maximum items to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,
    },

    /// Show one queued item
    ///
    /// Includes the idempotency key sent with every delivery attempt and,
    /// for items waiting on a retry, when the next attempt is due.
    Show {
        /// Queue item ID
        id: i64,
    },

    /// Queue an operation for delivery
    ///
    /// The operation is stored durably and never sent by this command;
    /// use 'fieldsync run' to deliver it. Inspections and field operations
    /// are also saved to the offline cache as pending records.
    ///
    /// # Operation types
    ///
    ///   inspection, field-operation, plot-update, farm-update,
    ///   image-upload, vegetation-index-request
    ///
    /// # Examples
    ///
    ///   fieldsync enqueue -t plot-update -p '{"id":"p1","crop":"soy"}'
    ///   fieldsync enqueue -t farm-update -p '{"id":"f1","name":"North"}' --depends-on 3
    Enqueue(EnqueueArgs),

    /// Deliver queued items
    ///
    /// Checks that the API is reachable, recovers items interrupted by a
    /// previous crash and runs a sync pass. With --wait the command keeps
    /// running until scheduled retries and follow-up passes are done.
    ///
    /// # Examples
    ///
    ///   fieldsync run
    ///   fieldsync run --wait
    ///   fieldsync run --offline      Recover only, do not contact the API
    Run {
        /// Treat the device as offline
        #[arg(long)]
        offline: bool,

        /// Wait for scheduled retries to finish
        #[arg(long)]
        wait: bool,
    },

    /// Cancel a queued item
    ///
    /// Only items that are not being delivered and not yet completed can be
    /// cancelled. Items other waiting items depend on must be cancelled
    /// after their dependents.
    Cancel {
        /// Queue item ID
        id: i64,
    },

    /// Retry failed items
    ///
    /// Resets the attempt count of failed items and runs a sync pass.
    ///
    /// # Examples
    ///
    ///   fieldsync retry 12
    ///   fieldsync retry --all
    Retry {
        /// Retry all failed items
        #[arg(long, conflicts_with = "id")]
        all: bool,

        /// Specific item ID to retry
        id: Option<i64>,
    },

    /// Remove old completed and failed items
    ///
    /// Uses the retention windows from the `sync` config section.
    Cleanup,

    /// Inspect and prune the offline cache
    Cache(CacheArgs),

    /// Check whether the API is reachable
    ///
    /// Sends a HEAD request to the health endpoint and classifies the
    /// connection as excellent, good, fair, poor or offline.
    Probe,
}

/// Arguments for `enqueue`.
#[derive(Args)]
pub struct EnqueueArgs {
    /// Operation type
    #[arg(long = "type", short = 't')]
    pub kind: String,

    /// Operation payload as JSON
    #[arg(long, short = 'p')]
    pub payload: String,

    /// Lower values are delivered first
    #[arg(long, default_value = "1", allow_negative_numbers = true)]
    pub priority: i32,

    /// Item that must be delivered before this one
    #[arg(long)]
    pub depends_on: Option<i64>,

    /// Free-form source label stored with the item
    #[arg(long, default_value = "cli")]
    pub origin: String,
}

/// Arguments for `cache`.
#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

/// Cache subcommands.
#[derive(Subcommand)]
pub enum CacheCommands {
    /// Remove stale time-series records and expired API responses
    Prune {
        /// Maximum age in days (defaults to `cache.max_age_days`)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Show cached records
    ///
    /// # Examples
    ///
    ///   fieldsync cache show plots
    ///   fieldsync cache show inspections local-42
    Show {
        /// Collection name (plots, vegetation_indices, productivity, weather,
        /// inspections, field_operations, api_cache)
        collection: String,

        /// Record key; all records when omitted
        key: Option<String>,
    },

    /// Show which data of a plot is available offline
    Availability {
        /// Plot ID
        plot_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "fieldsync",
            "enqueue",
            "-t",
            "plot-update",
            "-p",
            "{}",
            "--priority",
            "-1",
            "--depends-on",
            "4",
        ])
        .unwrap();

        let Commands::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.kind, "plot-update");
        assert_eq!(args.priority, -1);
        assert_eq!(args.depends_on, Some(4));
        assert_eq!(args.origin, "cli");
    }

    #[test]
    fn test_retry_all_conflicts_with_id() {
        assert!(Cli::try_parse_from(["fieldsync", "retry", "--all", "3"]).is_err());
    }

    #[test]
    fn test_global_output_flag() {
        let cli = Cli::try_parse_from(["fieldsync", "status", "-o", "json"]).unwrap();
        assert_eq!(cli.output, Some(OutputFormat::Json));
    }
}
