//! `sqlload loadtest check` command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use sqlload::loadtest::config::LoadTestConfig;
use sqlload::loadtest::session::{SessionFactory, SqlxSessionFactory};

use super::resolve_config_path;

/// Execute the `loadtest check` command.
///
/// Loads and validates the config, prints what the run would do and, unless
/// `offline`, opens one session and runs the health check against it.
pub async fn execute_check(
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    offline: bool,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let mut config = LoadTestConfig::load(&config_file)
        .with_context(|| format!("Failed to load config '{}'", config_file.display()))?;
    if let Some(url) = database_url.filter(|u| !u.trim().is_empty()) {
        config.database.url = Some(url);
    }

    println!("{} {}", "config ok:".green(), config_file.display());
    for line in describe(&config) {
        println!("  {line}");
    }

    if offline {
        return Ok(());
    }

    let factory = SqlxSessionFactory::from_config(&config.database);
    let target = config.database.display_target();
    let mut session = factory
        .connect(0)
        .await
        .with_context(|| format!("Health check against {target} failed"))?;
    session.close().await;

    println!("{} {}", "database ok:".green(), target);
    Ok(())
}

/// One line per relevant setting, in the order a reader checks them.
fn describe(config: &LoadTestConfig) -> Vec<String> {
    let test = &config.test;
    let total_weight: u64 = test.queries.iter().map(|q| u64::from(q.weight)).sum();

    let mut lines = vec![
        format!("target:   {}", config.database.display_target()),
        format!(
            "users:    {} (ramp-up {}s)",
            test.concurrent_users, test.ramp_up_secs
        ),
        format!("duration: {}s", test.duration_secs),
    ];
    for q in &test.queries {
        let share = q.weight as f64 * 100.0 / total_weight as f64;
        lines.push(format!("query:    {} [{}] {share:.1}%", q.name, q.kind));
    }
    if config.has_scaling() {
        for step in &config.scaling.steps {
            lines.push(format!(
                "scale:    at {}s -> {} users over {}s {}",
                step.at_secs, step.target_users, step.ramp_secs, step.description
            ));
        }
    }
    lines
}
