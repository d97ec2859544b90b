//! sqlload: weighted, scalable load generation for SQL databases.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// Load test PostgreSQL, MySQL and SQLite with weighted query mixes
#[derive(Parser)]
#[command(name = "sqlload")]
#[command(about = "Load test SQL databases with weighted query mixes", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, scaffold or check database load tests
    Loadtest {
        #[command(subcommand)]
        command: commands::loadtest::LoadtestCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Loadtest { command } => command.execute()?,
    }
    Ok(())
}

/// Initialize logging on stderr so the summary on stdout stays clean.
///
/// `LOG_FORMAT=json` switches to one JSON object per event.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
