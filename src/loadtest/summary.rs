//! Terminal summary renderer for load test results.
//!
//! Produces a colorized, human-readable summary with:
//! - ASCII header with the test configuration
//! - Dotted-line metric rows (metric.........: value)
//! - Per-query table with rate, error rate and latency percentiles
//!
//! [`render_summary`] is a pure function: structured data in, [`String`]
//! out. Colors follow the `colored` global override, which the CLI turns off
//! for `--no-color` or piped output.

use colored::Colorize;

use crate::loadtest::orchestrator::LoadTestResult;
use crate::loadtest::plan::TestPlan;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 36;

/// Widest query name shown before truncation.
const NAME_WIDTH: usize = 28;

/// Render the end-of-run summary.
///
/// # Layout
///
/// ```text
///      _____     |  sqlload
///     (_____)    |
///     |     |    |  target:    postgres://app@db:5432/shop
///     |_____|    |  users:     10 (peak 25)
///     (_____)    |  duration:  300s
///                |  queries:   4 defined
///
///   queries_total.....................: 18234
///   queries_succeeded.................: 18100
///   queries_failed....................: 134
///   error_rate........................: 0.7%
///   throughput........................: 60.8 q/s
///   workers_final.....................: 10
///   elapsed...........................: 300.0s
///
///   per-query metrics:
///
///   query                          total      rate   err%     avg     p50     p95     p99
/// ```
pub fn render_summary(result: &LoadTestResult, plan: &TestPlan, target: &str) -> String {
    let snap = &result.snapshot;
    let elapsed_secs = result.elapsed.as_secs_f64();
    let mut lines = Vec::new();

    lines.push(render_header(
        target,
        plan.concurrent_users,
        result.peak_workers,
        plan.duration.as_secs(),
        snap.queries.len(),
    ));

    if result.cancelled {
        lines.push(format!("  {}", "run cancelled before completion".yellow()));
        lines.push(String::new());
    }

    lines.push(format_metric_row(
        "queries_total",
        &snap.total_queries.to_string(),
        PAD_WIDTH,
    ));

    let succeeded = snap.total_queries - snap.total_errors;
    lines.push(format_metric_row(
        "queries_succeeded",
        &succeeded.to_string().green().to_string(),
        PAD_WIDTH,
    ));

    let failed = if snap.total_errors > 0 {
        snap.total_errors.to_string().red().to_string()
    } else {
        snap.total_errors.to_string()
    };
    lines.push(format_metric_row("queries_failed", &failed, PAD_WIDTH));

    lines.push(format_metric_row(
        "error_rate",
        &color_error_rate(snap.error_rate() * 100.0),
        PAD_WIDTH,
    ));

    let throughput = per_second(snap.total_queries, elapsed_secs);
    lines.push(format_metric_row(
        "throughput",
        &format!("{throughput:.1} q/s").green().to_string(),
        PAD_WIDTH,
    ));

    lines.push(format_metric_row(
        "workers_final",
        &result.final_workers.to_string(),
        PAD_WIDTH,
    ));

    lines.push(format_metric_row(
        "elapsed",
        &format!("{elapsed_secs:.1}s"),
        PAD_WIDTH,
    ));

    if !snap.queries.is_empty() {
        lines.push(String::new());
        lines.push("  per-query metrics:".to_string());
        lines.push(String::new());
        lines.push(format!(
            "  {:<NAME_WIDTH$} {:>7} {:>9} {:>6} {:>8} {:>8} {:>8} {:>8}",
            "query", "total", "rate", "err%", "avg", "p50", "p95", "p99"
        ));
        lines.push(format!("  {}", "\u{2500}".repeat(NAME_WIDTH + 59)));

        // BTreeMap keeps rows in name order.
        for (name, stats) in &snap.queries {
            let rate = per_second(stats.total_queries, elapsed_secs);
            let p99 = format!("{:.1}ms", stats.latency.p99);
            let p99_colored = if stats.latency.p99 > 1000.0 {
                p99.yellow().to_string()
            } else {
                p99.green().to_string()
            };

            lines.push(format!(
                "  {:<NAME_WIDTH$} {:>7} {:>9} {:>6} {:>8} {:>8} {:>8} {:>8}",
                truncate_name(name),
                stats.total_queries,
                format!("{rate:.1}/s"),
                color_error_rate(stats.error_rate() * 100.0),
                format!("{:.1}ms", stats.avg_duration_ms),
                format!("{:.1}ms", stats.latency.p50),
                format!("{:.1}ms", stats.latency.p95),
                p99_colored,
            ));
        }
    }

    lines.join("\n")
}

fn render_header(
    target: &str,
    users: usize,
    peak: usize,
    duration_secs: u64,
    query_count: usize,
) -> String {
    format!(
        r#"
     _____     |  {}
    (_____)    |
    |     |    |  target:    {}
    |_____|    |  users:     {} (peak {})
    (_____)    |  duration:  {}s
               |  queries:   {} defined
"#,
        "sqlload".bold(),
        target,
        users,
        peak,
        duration_secs,
        query_count,
    )
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

/// Green up to 1%, yellow up to 5%, red above.
fn color_error_rate(pct: f64) -> String {
    let s = format!("{pct:.1}%");
    if pct > 5.0 {
        s.red().to_string()
    } else if pct > 1.0 {
        s.yellow().to_string()
    } else {
        s.green().to_string()
    }
}

fn per_second(count: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn truncate_name(name: &str) -> String {
    if name.chars().count() <= NAME_WIDTH {
        return name.to_string();
    }
    let head: String = name.chars().take(NAME_WIDTH - 3).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::metrics::{LatencySummary, MetricsSnapshot, QueryStats};
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Disable colors in tests for deterministic assertions.
    fn setup_no_color() {
        colored::control::set_override(false);
    }

    fn stats(total: u64, failed: u64, p50: f64, p99: f64) -> QueryStats {
        QueryStats {
            total_queries: total,
            successful_queries: total - failed,
            failed_queries: failed,
            total_duration: Duration::from_millis(total * 5),
            avg_duration_ms: 5.0,
            rows_affected: 0,
            latency: LatencySummary {
                p50,
                p95: p99 / 2.0,
                p99,
                max: p99,
            },
        }
    }

    fn result(queries: BTreeMap<String, QueryStats>) -> LoadTestResult {
        let total_queries = queries.values().map(|s| s.total_queries).sum();
        let total_errors = queries.values().map(|s| s.failed_queries).sum();
        LoadTestResult {
            snapshot: MetricsSnapshot {
                queries,
                active_users: 0,
                active_connections: 0,
                total_queries,
                total_errors,
            },
            elapsed: Duration::from_secs(60),
            peak_workers: 25,
            final_workers: 10,
            cancelled: false,
        }
    }

    fn sample() -> LoadTestResult {
        result(BTreeMap::from([
            ("orders".to_string(), stats(800, 40, 12.0, 300.0)),
            ("lookup".to_string(), stats(200, 0, 2.5, 9.0)),
        ]))
    }

    fn plan() -> TestPlan {
        TestPlan::new(Duration::from_secs(60), 10)
    }

    #[test]
    fn test_header_shows_target_and_population() {
        setup_no_color();
        let output = render_summary(&sample(), &plan(), "postgres://app@db:5432/shop");

        assert!(output.contains("sqlload"));
        assert!(output.contains("postgres://app@db:5432/shop"));
        assert!(output.contains("10 (peak 25)"));
        assert!(output.contains("2 defined"));
    }

    #[test]
    fn test_totals_and_error_rate() {
        setup_no_color();
        let output = render_summary(&sample(), &plan(), "db");

        assert!(output.contains("queries_total"));
        assert!(output.contains(": 1000"));
        assert!(output.contains(": 960"));
        assert!(output.contains(": 40"));
        assert!(output.contains("4.0%"));
    }

    #[test]
    fn test_throughput_and_elapsed() {
        setup_no_color();
        let output = render_summary(&sample(), &plan(), "db");

        // 1000 queries / 60 s
        assert!(output.contains("16.7 q/s"));
        assert!(output.contains("60.0s"));
    }

    #[test]
    fn test_per_query_rows_in_name_order() {
        setup_no_color();
        let output = render_summary(&sample(), &plan(), "db");

        assert!(output.contains("per-query metrics:"));
        let lookup = output.find("lookup").expect("lookup row");
        let orders = output.find("orders").expect("orders row");
        assert!(lookup < orders);
        assert!(output.contains("300.0ms"));
        assert!(output.contains("2.5ms"));
    }

    #[test]
    fn test_empty_snapshot_omits_table() {
        setup_no_color();
        let output = render_summary(&result(BTreeMap::new()), &plan(), "db");

        assert!(!output.contains("per-query metrics:"));
        assert!(output.contains("0.0 q/s"));
    }

    #[test]
    fn test_cancelled_run_is_flagged() {
        setup_no_color();
        let mut r = sample();
        r.cancelled = true;
        let output = render_summary(&r, &plan(), "db");
        assert!(output.contains("cancelled"));
    }

    #[test]
    fn test_long_names_truncated() {
        let name = "a".repeat(40);
        let shown = truncate_name(&name);
        assert_eq!(shown.chars().count(), NAME_WIDTH);
        assert!(shown.ends_with("..."));
        assert_eq!(truncate_name("short"), "short");
    }

    #[test]
    fn test_format_metric_row_dot_padding() {
        let row = format_metric_row("elapsed", "1.0s", 20);
        assert!(row.contains("elapsed.............: 1.0s"));
    }
}
