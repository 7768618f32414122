//! Tuning knobs for the conductor, its executor and its performance tracker.

use std::time::Duration;

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Extra attempts granted to a beat with the `retry` policy.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl ExecutorConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// saturating at `Duration::MAX`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
    }
}

/// Performance tracker configuration.
#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    /// Completed records kept per history list; on overflow the oldest half goes.
    pub history_cap: usize,
    /// A beat active longer than this shows up in the warnings query.
    pub beat_warning_threshold: Duration,
    /// A run active longer than this shows up in the warnings query.
    pub sequence_warning_threshold: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            history_cap: 1000,
            beat_warning_threshold: Duration::from_secs(5),
            sequence_warning_threshold: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration handed to [`crate::Conductor::new`].
#[derive(Debug, Clone, Default)]
pub struct ConductorConfig {
    pub executor: ExecutorConfig,
    pub performance: PerformanceConfig,
}

impl ConductorConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());

        let max_retries = parse("CONDUCTOR_MAX_RETRIES")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.executor.max_retries);

        let retry_base_delay = parse("CONDUCTOR_RETRY_BASE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.executor.retry_base_delay);

        let history_cap = parse("CONDUCTOR_TIMING_HISTORY_CAP")
            .and_then(|n| usize::try_from(n).ok())
            .filter(|cap| *cap > 0)
            .unwrap_or(defaults.performance.history_cap);

        let beat_warning_threshold = parse("CONDUCTOR_BEAT_WARNING_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.performance.beat_warning_threshold);

        let sequence_warning_threshold = parse("CONDUCTOR_SEQUENCE_WARNING_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.performance.sequence_warning_threshold);

        Self {
            executor: ExecutorConfig {
                max_retries,
                retry_base_delay,
            },
            performance: PerformanceConfig {
                history_cap,
                beat_warning_threshold,
                sequence_warning_threshold,
            },
        }
    }
}
