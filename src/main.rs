use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use fieldsync::cli::args::{Cli, Commands};
use fieldsync::cli::commands::{self, Context};
use fieldsync::config::{ColorSetting, Paths};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "fieldsync=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = match cli.home {
        Some(root) => Paths::with_root(root),
        None => Paths::new()?,
    };
    let ctx = Context::open(paths)?;

    match ctx.config.general.color {
        ColorSetting::Always => colored::control::set_override(true),
        ColorSetting::Never => colored::control::set_override(false),
        ColorSetting::Auto => {}
    }
    let format = cli.output.unwrap_or(ctx.config.general.default_output);

    let output = match cli.command {
        Commands::Status => commands::status(&ctx, format)?,
        Commands::List { status, limit } => {
            commands::list(&ctx, status.as_deref(), limit, format)?
        }
        Commands::Show { id } => commands::show(&ctx, id, format)?,
        Commands::Enqueue(args) => commands::enqueue(&ctx, args, format)?,
        Commands::Run { offline, wait } => commands::run(&ctx, offline, wait, format).await?,
        Commands::Cancel { id } => commands::cancel(&ctx, id, format)?,
        Commands::Retry { all, id } => commands::retry(&ctx, all, id, format).await?,
        Commands::Cleanup => commands::cleanup(&ctx, format)?,
        Commands::Cache(args) => commands::cache(&ctx, args.command, format)?,
        Commands::Probe => commands::probe(&ctx, format).await?,
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
