//! Resolved run parameters consumed by the orchestrator and workers.
//!
//! [`LoadTestConfig`](crate::loadtest::config::LoadTestConfig) speaks in
//! seconds and milliseconds as written in TOML. The engine only ever sees
//! the [`Duration`]-typed values defined here, which also makes it easy for
//! tests to drive sub-second scenarios directly.

use std::time::Duration;

/// Smallest stagger interval between two worker starts or stops.
pub const MIN_STAGGER: Duration = Duration::from_millis(1);

/// Default upper bound on rows counted for a single `select` execution.
pub const DEFAULT_ROW_CAP: u64 = 1000;

/// Default think-time jitter bounds, as a multiplier of the configured think time.
pub const DEFAULT_JITTER: (f64, f64) = (0.8, 1.2);

/// Per-worker execution settings shared by every worker of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Base pause between two executions.
    pub think_time: Duration,
    /// Lower bound of the uniform think-time multiplier.
    pub jitter_min: f64,
    /// Upper bound of the uniform think-time multiplier.
    pub jitter_max: f64,
    /// Maximum rows counted for row-returning executions.
    pub row_cap: u64,
    /// Deadline applied to every database call.
    pub query_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            think_time: Duration::from_secs(1),
            jitter_min: DEFAULT_JITTER.0,
            jitter_max: DEFAULT_JITTER.1,
            row_cap: DEFAULT_ROW_CAP,
            query_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerSettings {
    /// Scale the base think time by `factor`.
    ///
    /// The factor is expected to come from `[jitter_min, jitter_max]`.
    pub fn think_time_with(&self, factor: f64) -> Duration {
        self.think_time.mul_f64(factor.max(0.0))
    }
}

/// A single timed change of the worker population.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingStep {
    /// Offset from test start at which the step fires.
    pub at: Duration,
    /// Worker count to reach.
    pub target: usize,
    /// Window over which the adds or removes are staggered.
    pub ramp: Duration,
    /// Human-readable label used in logs.
    pub description: String,
}

/// Ordered sequence of [`ScalingStep`]s applied during the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalingPlan {
    pub enabled: bool,
    pub steps: Vec<ScalingStep>,
}

impl ScalingPlan {
    /// A plan that never changes the population.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns `true` if the driver has anything to do.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.steps.is_empty()
    }
}

/// Everything the orchestrator needs to run one load test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    /// Steady-state run time, counted from the end of ramp-up.
    pub duration: Duration,
    /// Initial worker population.
    pub concurrent_users: usize,
    /// Window over which the initial population is started.
    pub ramp_up: Duration,
    pub worker: WorkerSettings,
    pub scaling: ScalingPlan,
}

impl TestPlan {
    /// Create a plan with default worker settings and no scaling.
    pub fn new(duration: Duration, concurrent_users: usize) -> Self {
        Self {
            duration,
            concurrent_users,
            ramp_up: Duration::ZERO,
            worker: WorkerSettings::default(),
            scaling: ScalingPlan::disabled(),
        }
    }

    /// Sets the ramp-up window.
    pub fn with_ramp_up(mut self, ramp_up: Duration) -> Self {
        self.ramp_up = ramp_up;
        self
    }

    /// Sets the base think time.
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.worker.think_time = think_time;
        self
    }

    /// Sets the per-query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.worker.query_timeout = timeout;
        self
    }

    /// Sets the scaling plan.
    pub fn with_scaling(mut self, scaling: ScalingPlan) -> Self {
        self.scaling = scaling;
        self
    }
}

/// Interval between consecutive starts (or stops) when spreading `count`
/// operations over `window`.
///
/// Returns `None` when the window is zero, meaning "all at once". Otherwise
/// the interval is floored at [`MIN_STAGGER`].
pub fn stagger_interval(window: Duration, count: usize) -> Option<Duration> {
    if window.is_zero() || count == 0 {
        return None;
    }
    let per = window / u32::try_from(count).unwrap_or(u32::MAX);
    Some(per.max(MIN_STAGGER))
}
