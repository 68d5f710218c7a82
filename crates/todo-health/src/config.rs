use std::time::Duration;

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PERFORMANCE_THRESHOLD_MS: u64 = 1_000;
pub const DEFAULT_STORAGE_WARNING_PERCENT: f64 = 80.0;
pub const DEFAULT_STORAGE_CRITICAL_PERCENT: f64 = 95.0;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Probe latency above this raises a performance issue.
    pub performance_threshold: Duration,
    /// Percentages of the storage quota in use.
    pub storage_warning_threshold: f64,
    pub storage_critical_threshold: f64,
    pub max_consecutive_failures: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            performance_threshold: Duration::from_millis(DEFAULT_PERFORMANCE_THRESHOLD_MS),
            storage_warning_threshold: DEFAULT_STORAGE_WARNING_PERCENT,
            storage_critical_threshold: DEFAULT_STORAGE_CRITICAL_PERCENT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl HealthConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// A zero interval would spin the timer task.
    pub fn effective_interval(&self) -> Duration {
        self.check_interval.max(Duration::from_millis(1))
    }
}
