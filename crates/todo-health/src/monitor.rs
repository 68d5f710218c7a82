//! Periodic store health checks.
//!
//! A [`HealthMonitor`] is a cheap cloneable handle. The timer task it spawns
//! holds only a weak reference, so dropping every handle ends the task even
//! without an explicit [`HealthMonitor::stop`].
//!
//! Checks are single-flight: a timer tick that finds a check already running
//! is skipped, while explicit [`HealthMonitor::perform_health_check`] calls
//! wait their turn. `stop()` advances a run epoch so that a check still in
//! flight neither commits its metrics nor notifies listeners.

use crate::classify::classify_failure;
use crate::config::HealthConfig;
use crate::probe::{ProbeFailure, QuotaEstimate, QuotaSource, QuotaUnavailable, StoreProbe};
use crate::types::{
    HealthCheck, HealthIssue, HealthMetrics, HealthStatus, IssueKind, IssueSeverity, StorageQuota,
    SyncStatus,
};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use todo_core::OperationObserver;
use todo_storage::StoreInfo;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type Listener = Arc<dyn Fn(&HealthCheck) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct HealthMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    probe: Arc<dyn StoreProbe>,
    quota: RwLock<Option<Arc<dyn QuotaSource>>>,
    config: HealthConfig,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    gate: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
}

#[derive(Default)]
struct MonitorState {
    metrics: HealthMetrics,
    last_check: Option<HealthCheck>,
    task: Option<JoinHandle<()>>,
}

struct ProbeOutcome {
    result: Result<StoreInfo, ProbeFailure>,
    elapsed: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn StoreProbe>, config: HealthConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                probe,
                quota: RwLock::new(None),
                config,
                state: Mutex::new(MonitorState::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                gate: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_quota_source(self, quota: Arc<dyn QuotaSource>) -> Self {
        *self
            .shared
            .quota
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(quota);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.shared.config
    }

    /// Spawns the timer task. Returns false when the monitor was already
    /// running or no tokio runtime is available to run it.
    pub fn start(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!(event = "health_monitor_start_failed", reason = "no_runtime");
            return false;
        };
        let mut state = self.shared.state();
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(event = "health_monitor_already_running");
            return false;
        }

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let interval = self.shared.config.effective_interval();
        let weak = Arc::downgrade(&self.shared);
        state.task = Some(runtime.spawn(run_timer(weak, epoch, interval)));
        info!(
            event = "health_monitor_started",
            interval_ms = interval.as_millis() as u64
        );
        true
    }

    /// Cancels the timer. Idempotent.
    pub fn stop(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let task = self.shared.state().task.take();
        if let Some(task) = task {
            task.abort();
            info!(event = "health_monitor_stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .state()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Runs one check now, waiting for any check already in flight.
    pub async fn perform_health_check(&self) -> HealthCheck {
        let _guard = self.shared.gate.lock().await;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.shared.run_check(epoch).await
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&HealthCheck) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::SeqCst));
        self.shared.listeners().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn metrics(&self) -> HealthMetrics {
        self.shared.state().metrics.clone()
    }

    pub fn last_check(&self) -> Option<HealthCheck> {
        self.shared.state().last_check.clone()
    }

    pub fn record_successful_operation(&self, response_time_ms: Option<u64>) {
        self.shared
            .state()
            .metrics
            .record_success(Utc::now(), response_time_ms);
    }

    pub fn record_failed_operation(&self) {
        let failures = {
            let mut state = self.shared.state();
            state.metrics.record_failure();
            state.metrics.consecutive_failures
        };
        debug!(event = "store_operation_failed", consecutive_failures = failures);
    }

    pub fn update_sync_status(&self, status: SyncStatus) {
        self.shared.state().metrics.sync_status = status;
    }
}

impl OperationObserver for HealthMonitor {
    fn record_success(&self, response_time_ms: Option<u64>) {
        self.record_successful_operation(response_time_ms);
    }

    fn record_failure(&self) {
        self.record_failed_operation();
    }
}

async fn run_timer(shared: Weak<Shared>, epoch: u64, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let Ok(_guard) = shared.gate.try_lock() else {
            debug!(event = "health_check_skipped", reason = "in_flight");
            continue;
        };
        shared.run_check(epoch).await;
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quota_source(&self) -> Option<Arc<dyn QuotaSource>> {
        self.quota
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Caller holds the gate.
    async fn run_check(&self, epoch: u64) -> HealthCheck {
        let outcome = self.probe().await;
        let quota = match self.quota_source() {
            Some(source) => self.estimate_quota(source.as_ref()).await,
            None => None,
        };

        let mut state = self.state();
        let current = self.epoch.load(Ordering::SeqCst) == epoch;
        let mut scratch;
        let metrics = if current {
            &mut state.metrics
        } else {
            scratch = state.metrics.clone();
            &mut scratch
        };
        let issues = assess(metrics, &outcome, quota, &self.config);
        let check = HealthCheck {
            timestamp: Utc::now(),
            status: HealthStatus::derive(metrics, &issues),
            metrics: metrics.clone(),
            issues,
        };

        if !current {
            drop(state);
            debug!(event = "health_check_discarded", reason = "stopped");
            return check;
        }
        state.last_check = Some(check.clone());
        drop(state);

        debug!(
            event = "health_check",
            status = %check.status,
            issues = check.issues.len(),
            consecutive_failures = check.metrics.consecutive_failures
        );
        self.notify(&check);
        check
    }

    async fn probe(&self) -> ProbeOutcome {
        let timeout = self.config.probe_timeout;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.probe.info()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
        };
        ProbeOutcome {
            result,
            elapsed: started.elapsed(),
        }
    }

    async fn estimate_quota(&self, source: &dyn QuotaSource) -> Option<QuotaEstimate> {
        let estimate = match tokio::time::timeout(self.config.probe_timeout, source.estimate()).await
        {
            Ok(estimate) => estimate,
            Err(_) => Err(QuotaUnavailable("estimate timed out".to_string())),
        };
        match estimate {
            Ok(estimate) => Some(estimate),
            Err(err) => {
                warn!(event = "storage_quota_unavailable", error = %err);
                None
            }
        }
    }

    fn notify(&self, check: &HealthCheck) {
        let listeners = self.listeners().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(check))).is_err() {
                error!(event = "health_listener_panicked", listener = id.0);
            }
        }
    }
}

/// Folds one probe outcome and quota reading into `metrics` and returns the
/// issues they raise.
fn assess(
    metrics: &mut HealthMetrics,
    outcome: &ProbeOutcome,
    quota: Option<QuotaEstimate>,
    config: &HealthConfig,
) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    let elapsed_ms = outcome.elapsed.as_millis().min(u64::MAX as u128) as u64;

    match &outcome.result {
        Ok(_) => {
            metrics.record_success(Utc::now(), Some(elapsed_ms));
            let threshold = config.performance_threshold;
            if outcome.elapsed > threshold {
                let severity = if outcome.elapsed > threshold * 2 {
                    IssueSeverity::High
                } else {
                    IssueSeverity::Medium
                };
                issues.push(HealthIssue {
                    kind: IssueKind::Performance,
                    severity,
                    message: format!(
                        "Store responded in {elapsed_ms}ms (threshold {}ms)",
                        threshold.as_millis()
                    ),
                    resolution: Some(
                        "Close other tabs or clients, or compact the store".to_string(),
                    ),
                    error_kind: None,
                });
            }
        }
        Err(failure) => {
            metrics.record_failure();
            let kind = classify_failure(failure);
            let severity = if metrics.consecutive_failures >= config.max_consecutive_failures {
                IssueSeverity::Critical
            } else {
                IssueSeverity::High
            };
            warn!(
                event = "store_probe_failed",
                error = %failure,
                error_kind = %kind,
                retryable = kind.retryable(),
                consecutive_failures = metrics.consecutive_failures
            );
            issues.push(HealthIssue {
                kind: IssueKind::Connectivity,
                severity,
                message: format!(
                    "Store check failed ({} in a row): {failure}",
                    metrics.consecutive_failures
                ),
                resolution: Some(kind.resolution().to_string()),
                error_kind: Some(kind),
            });
        }
    }

    if let Some(estimate) = quota {
        let quota = StorageQuota::from(estimate);
        let severity = if quota.percentage >= config.storage_critical_threshold {
            Some(IssueSeverity::Critical)
        } else if quota.percentage >= config.storage_warning_threshold {
            Some(IssueSeverity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            issues.push(HealthIssue {
                kind: IssueKind::Storage,
                severity,
                message: format!("Storage is {:.1}% full", quota.percentage),
                resolution: Some("Remove old todos or attachments to free space".to_string()),
                error_kind: None,
            });
        }
        metrics.storage_quota = Some(quota);
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StoreInfo {
        StoreInfo {
            db_name: "todos_ada".to_string(),
            doc_count: 3,
            update_seq: 9,
        }
    }

    fn ok(elapsed_ms: u64) -> ProbeOutcome {
        ProbeOutcome {
            result: Ok(info()),
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    fn failed(failure: ProbeFailure) -> ProbeOutcome {
        ProbeOutcome {
            result: Err(failure),
            elapsed: Duration::from_millis(5),
        }
    }

    struct IdleProbe;

    #[async_trait::async_trait]
    impl StoreProbe for IdleProbe {
        async fn info(&self) -> Result<StoreInfo, ProbeFailure> {
            Ok(info())
        }
    }

    #[test]
    fn start_without_runtime_reports_false() {
        let monitor = HealthMonitor::new(Arc::new(IdleProbe), HealthConfig::default());
        assert!(!monitor.start());
        assert!(!monitor.is_running());
        monitor.stop();
    }

    #[test]
    fn fast_success_raises_nothing() {
        let mut metrics = HealthMetrics::default();
        let issues = assess(&mut metrics, &ok(20), None, &HealthConfig::default());
        assert!(issues.is_empty());
        assert!(metrics.is_connected);
        assert_eq!(metrics.last_response_time_ms, Some(20));
    }

    #[test]
    fn slow_success_is_graded_against_threshold() {
        let config = HealthConfig::default();
        let mut metrics = HealthMetrics::default();
        let medium = assess(&mut metrics, &ok(1_500), None, &config);
        assert_eq!(medium[0].kind, IssueKind::Performance);
        assert_eq!(medium[0].severity, IssueSeverity::Medium);
        let high = assess(&mut metrics, &ok(2_500), None, &config);
        assert_eq!(high[0].severity, IssueSeverity::High);
        assert!(assess(&mut metrics, &ok(1_000), None, &config).is_empty());
    }

    #[test]
    fn failure_streak_escalates_to_critical() {
        let config = HealthConfig::default();
        let mut metrics = HealthMetrics::default();
        let failure = || failed(ProbeFailure::Other("disk I/O error".to_string()));
        let first = assess(&mut metrics, &failure(), None, &config);
        let second = assess(&mut metrics, &failure(), None, &config);
        let third = assess(&mut metrics, &failure(), None, &config);
        assert_eq!(first[0].severity, IssueSeverity::High);
        assert_eq!(second[0].severity, IssueSeverity::High);
        assert_eq!(third[0].severity, IssueSeverity::Critical);
        assert_eq!(
            third[0].error_kind,
            Some(crate::classify::ErrorKind::OperationFailed)
        );
        assert_eq!(metrics.consecutive_failures, 3);
    }

    #[test]
    fn quota_thresholds_are_inclusive() {
        let config = HealthConfig::default();
        let mut metrics = HealthMetrics::default();
        let at = |usage| {
            Some(QuotaEstimate {
                usage,
                quota: 100,
            })
        };
        assert!(assess(&mut metrics, &ok(1), at(79), &config).is_empty());
        let warning = assess(&mut metrics, &ok(1), at(80), &config);
        assert_eq!(warning[0].kind, IssueKind::Storage);
        assert_eq!(warning[0].severity, IssueSeverity::Medium);
        let critical = assess(&mut metrics, &ok(1), at(95), &config);
        assert_eq!(critical[0].severity, IssueSeverity::Critical);
        assert_eq!(metrics.storage_quota.map(|quota| quota.used), Some(95));
    }
}
