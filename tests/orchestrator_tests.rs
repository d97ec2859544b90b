//! End-to-end orchestrator behavior against scripted sessions.
//!
//! Timing assertions use generous windows; every test runs on the
//! multi-threaded runtime so worker tasks and samplers progress in parallel.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{catalog, ScriptedFactory};
use sqlload::loadtest::error_log::ErrorLog;
use sqlload::loadtest::metrics::MetricsAggregator;
use sqlload::loadtest::orchestrator::LoadTester;
use sqlload::loadtest::plan::{ScalingPlan, ScalingStep, TestPlan};

fn tester(plan: TestPlan, factory: &ScriptedFactory) -> Arc<LoadTester> {
    Arc::new(LoadTester::new(
        plan.with_think_time(Duration::from_millis(20)),
        catalog(&[("q", 1)]),
        Arc::new(MetricsAggregator::new()),
        Arc::new(factory.clone()),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ramp_up_staggers_worker_starts() {
    let factory = ScriptedFactory::new();
    let plan = TestPlan::new(Duration::from_secs(5), 5).with_ramp_up(Duration::from_millis(500));
    let lt = tester(plan, &factory);

    let started = Instant::now();
    let ramp = tokio::spawn({
        let lt = lt.clone();
        async move { lt.start_workers().await }
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    let midway = lt.active_workers();
    assert!((2..=4).contains(&midway), "expected ~3 workers at 250ms, saw {midway}");

    ramp.await.unwrap().unwrap();
    let ramp_time = started.elapsed();
    assert!(
        ramp_time >= Duration::from_millis(380) && ramp_time <= Duration::from_millis(700),
        "5th worker started after {ramp_time:?}"
    );
    assert_eq!(lt.active_workers(), 5);

    lt.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scaling_plan_reaches_final_target() {
    let factory = ScriptedFactory::new();
    let scaling = ScalingPlan {
        enabled: true,
        steps: vec![
            ScalingStep {
                at: Duration::ZERO,
                target: 2,
                ramp: Duration::ZERO,
                description: "baseline".to_string(),
            },
            ScalingStep {
                at: Duration::from_secs(1),
                target: 5,
                ramp: Duration::from_millis(500),
                description: "peak".to_string(),
            },
        ],
    };
    let plan = TestPlan::new(Duration::from_secs(2), 2).with_scaling(scaling);
    let lt = tester(plan, &factory);

    let run = tokio::spawn({
        let lt = lt.clone();
        async move { lt.run().await }
    });

    let mut samples = Vec::new();
    while !run.is_finished() {
        samples.push(lt.active_workers());
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let result = run.await.unwrap().unwrap();

    assert!(!result.cancelled);
    assert_eq!(result.final_workers, 5);
    assert_eq!(result.peak_workers, 5);
    assert!(
        samples.iter().any(|&n| n > 2 && n < 5),
        "no intermediate population observed in {samples:?}"
    );
    assert_eq!(factory.ledger.connects(), 5);
    assert_eq!(factory.ledger.closes(), 5);
    assert_eq!(lt.active_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scale_to_current_size_is_a_no_op() {
    let factory = ScriptedFactory::new();
    let lt = tester(TestPlan::new(Duration::from_secs(5), 3), &factory);
    lt.start_workers().await.unwrap();

    lt.scale_users(3, Duration::from_millis(300), "same").await.unwrap();

    assert_eq!(factory.ledger.connects(), 3);
    assert_eq!(factory.ledger.closes(), 0);
    assert_eq!(lt.active_workers(), 3);
    lt.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gauge_tracks_population_through_scaling() {
    let factory = ScriptedFactory::new();
    let lt = tester(TestPlan::new(Duration::from_secs(5), 2), &factory);
    lt.start_workers().await.unwrap();

    lt.scale_users(6, Duration::ZERO, "up").await.unwrap();
    assert_eq!(lt.active_workers(), 6);
    assert_eq!(lt.stats().target_workers, 6);

    lt.scale_users(2, Duration::from_millis(100), "down").await.unwrap();
    assert_eq!(lt.active_workers(), 2);
    assert_eq!(lt.metrics().snapshot().active_users, 2);

    // Stopped workers release their sessions as soon as their loop exits.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.ledger.open(), 2);
    assert_eq!(lt.metrics().active_connections(), 2);

    lt.close().await;
    assert_eq!(factory.ledger.open(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_releases_each_session_once() {
    let factory = ScriptedFactory::new();
    let lt = tester(TestPlan::new(Duration::from_secs(5), 4), &factory);
    lt.start_workers().await.unwrap();

    tokio::join!(lt.close(), lt.close());
    lt.close().await;

    assert_eq!(factory.ledger.connects(), 4);
    assert_eq!(factory.ledger.closes(), 4);
    assert!(lt.metrics().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_query_is_counted_and_workers_keep_going() {
    let factory = ScriptedFactory::new().failing(&["bad"]);
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("errors.jsonl");
    let lt = LoadTester::new(
        TestPlan::new(Duration::from_millis(400), 2).with_think_time(Duration::from_millis(10)),
        catalog(&[("good", 1), ("bad", 1)]),
        Arc::new(MetricsAggregator::new()),
        Arc::new(factory.clone()),
    )
    .with_error_log(Arc::new(ErrorLog::open(&log_path).unwrap()));

    let result = lt.run().await.unwrap();
    let bad = result.snapshot.query("bad").expect("bad was selected");
    let good = result.snapshot.query("good").expect("good was selected");

    assert!(bad.failed_queries > 0);
    assert_eq!(bad.successful_queries, 0);
    assert_eq!(bad.failed_queries, bad.total_queries);
    assert_eq!(good.failed_queries, 0);
    assert!(good.successful_queries > 1);
    assert_eq!(result.snapshot.total_errors, bad.failed_queries);

    let logged = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(logged.lines().count() as u64, bad.failed_queries);
    assert!(logged.lines().all(|l| l.contains("\"query\":\"bad\"")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_cancel_ends_run_early() {
    let factory = ScriptedFactory::new();
    let lt = tester(TestPlan::new(Duration::from_secs(30), 3), &factory);
    let cancel = lt.cancel_token();

    let started = Instant::now();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let result = lt.run().await.unwrap();

    assert!(result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.final_workers, 3);
    assert_eq!(factory.ledger.open(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_file_is_rewritten_during_run() {
    let factory = ScriptedFactory::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.json");
    let lt = LoadTester::new(
        TestPlan::new(Duration::from_millis(600), 2).with_think_time(Duration::from_millis(10)),
        catalog(&[("q", 1)]),
        Arc::new(MetricsAggregator::new()),
        Arc::new(factory),
    )
    .with_snapshot_file(&path, Duration::from_millis(100));

    let run = lt.run();
    tokio::pin!(run);
    let mut seen_midrun = false;
    let result = loop {
        tokio::select! {
            result = &mut run => break result.unwrap(),
            _ = tokio::time::sleep(Duration::from_millis(350)), if !seen_midrun => {
                seen_midrun = path.exists();
            }
        }
    };

    assert!(seen_midrun, "periodic flush did not write during the run");
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["q"]["total_queries"].as_u64().unwrap(), result.snapshot.total_queries);
    assert_eq!(json["active_users"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_snapshot_file_matches_result() {
    let names: Vec<String> = (0..400).map(|i| format!("query_{i:03}")).collect();
    let entries: Vec<(&str, u32)> = names.iter().map(|n| (n.as_str(), 1)).collect();

    for round in 0..5 {
        let factory = ScriptedFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let lt = LoadTester::new(
            TestPlan::new(Duration::from_millis(200), 50).with_think_time(Duration::from_millis(1)),
            catalog(&entries),
            Arc::new(MetricsAggregator::new()),
            Arc::new(factory),
        )
        .with_snapshot_file(&path, Duration::from_millis(1));

        let result = lt.run().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content)
            .unwrap_or_else(|e| panic!("round {round}: snapshot is not valid JSON: {e}"));
        assert_eq!(json["active_users"], 0, "round {round}");

        let file_total: u64 = json
            .as_object()
            .unwrap()
            .iter()
            .filter_map(|(_, v)| v.get("total_queries").and_then(|t| t.as_u64()))
            .sum();
        assert_eq!(file_total, result.snapshot.total_queries, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_racing_end_of_run_releases_every_session_once() {
    for delay_ms in [250u64, 290, 300, 310, 350] {
        let factory = ScriptedFactory::new();
        let lt = tester(TestPlan::new(Duration::from_millis(300), 4), &factory);

        let run = tokio::spawn({
            let lt = lt.clone();
            async move { lt.run().await }
        });
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        lt.close().await;

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run returns after close")
            .unwrap()
            .unwrap();

        assert_eq!(result.snapshot.active_users, 0, "close at {delay_ms}ms");
        assert_eq!(factory.ledger.connects(), 4, "close at {delay_ms}ms");
        assert_eq!(factory.ledger.closes(), factory.ledger.connects(), "close at {delay_ms}ms");
        assert_eq!(factory.ledger.close_calls(), factory.ledger.closes(), "close at {delay_ms}ms");
        assert_eq!(lt.metrics().active_connections(), 0);
        assert!(lt.metrics().is_closed());
    }
}
