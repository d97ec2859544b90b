//! `sqlload loadtest` CLI subcommands.
//!
//! Provides `run` (execute a load test), `init` (generate a starter config)
//! and `check` (validate a config and probe the database).

mod check;
mod init;
mod run;

use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

/// Directory searched for `loadtest.toml` during config discovery.
const CONFIG_DIR: &str = ".sqlload";
const CONFIG_FILE: &str = "loadtest.toml";

/// Engines `init` can generate a template for.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TemplateEngine {
    Postgres,
    Mysql,
    Sqlite,
}

/// Load test commands for SQL databases.
#[derive(Debug, Subcommand)]
pub enum LoadtestCommand {
    /// Run a load test against a database
    ///
    /// Executes the query mix defined in .sqlload/loadtest.toml (or a custom
    /// config path), prints a summary and writes the JSON metrics snapshot.
    Run {
        /// Path to config file (default: auto-discover .sqlload/loadtest.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of concurrent users (overrides config)
        #[arg(long)]
        users: Option<u32>,

        /// Test duration in seconds (overrides config)
        #[arg(long)]
        duration: Option<u64>,

        /// Connection URL (overrides the [database] section)
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: Option<String>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Generate a starter loadtest config file
    ///
    /// Creates .sqlload/loadtest.toml with commented defaults and a small
    /// example query mix for the chosen engine.
    Init {
        /// Database engine the template targets
        #[arg(long, value_enum, default_value = "postgres")]
        engine: TemplateEngine,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Validate a config file and health-check one database session
    Check {
        /// Path to config file (default: auto-discover .sqlload/loadtest.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Connection URL (overrides the [database] section)
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: Option<String>,

        /// Only validate the file, do not connect
        #[arg(long)]
        offline: bool,
    },
}

impl LoadtestCommand {
    /// Execute the selected loadtest subcommand.
    pub fn execute(self) -> Result<()> {
        match self {
            LoadtestCommand::Run {
                config,
                users,
                duration,
                database_url,
                no_color,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(
                    config,
                    users,
                    duration,
                    database_url,
                    no_color,
                ))
            },
            LoadtestCommand::Init { engine, force } => {
                let cwd = std::env::current_dir()?;
                init::execute_init(&cwd, engine, force)
            },
            LoadtestCommand::Check {
                config,
                database_url,
                offline,
            } => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(check::execute_check(config, database_url, offline))
            },
        }
    }
}

/// Use the explicit `--config` path, or discover one from the working directory.
fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `sqlload loadtest init` to create one.",
                    path.display()
                );
            }
            Ok(path)
        },
        None => {
            let cwd = std::env::current_dir()?;
            match discover_config(&cwd) {
                Some(path) => Ok(path),
                None => anyhow::bail!(
                    "No loadtest config found.\n\
                     Run `sqlload loadtest init` to create {CONFIG_DIR}/{CONFIG_FILE},\n\
                     or use `--config path/to/file.toml` to specify one."
                ),
            }
        },
    }
}

/// Discover `.sqlload/loadtest.toml` by walking parent directories.
///
/// Starts from `start` and walks up until either the file is found or the
/// filesystem root is reached, like `.git` discovery.
fn discover_config(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
