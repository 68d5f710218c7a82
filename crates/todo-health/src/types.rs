use crate::classify::ErrorKind;
use crate::probe::QuotaEstimate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Disconnected,
    Connected,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub used: u64,
    pub available: u64,
    pub percentage: f64,
}

impl From<QuotaEstimate> for StorageQuota {
    fn from(estimate: QuotaEstimate) -> Self {
        let percentage = if estimate.quota == 0 {
            100.0
        } else {
            estimate.usage as f64 / estimate.quota as f64 * 100.0
        };
        Self {
            used: estimate.usage,
            available: estimate.quota.saturating_sub(estimate.usage),
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub is_connected: bool,
    pub last_successful_operation: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_response_time_ms: Option<u64>,
    pub sync_status: SyncStatus,
    pub storage_quota: Option<StorageQuota>,
}

impl HealthMetrics {
    pub fn record_success(&mut self, at: DateTime<Utc>, response_time_ms: Option<u64>) {
        self.is_connected = true;
        self.consecutive_failures = 0;
        self.last_successful_operation = Some(at);
        if response_time_ms.is_some() {
            self.last_response_time_ms = response_time_ms;
        }
    }

    pub fn record_failure(&mut self) {
        self.is_connected = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Connectivity,
    Performance,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Coarse bucketing: anything short of critical on a connected store is
    /// merely degraded.
    pub fn derive(metrics: &HealthMetrics, issues: &[HealthIssue]) -> Self {
        if issues.is_empty() {
            HealthStatus::Healthy
        } else if !metrics.is_connected
            || issues
                .iter()
                .any(|issue| issue.severity == IssueSeverity::Critical)
        {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub issues: Vec<HealthIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn issue(kind: IssueKind, severity: IssueSeverity) -> HealthIssue {
        HealthIssue {
            kind,
            severity,
            message: "test".to_string(),
            resolution: None,
            error_kind: None,
        }
    }

    #[test]
    fn status_buckets() {
        let connected = HealthMetrics {
            is_connected: true,
            ..HealthMetrics::default()
        };
        assert_eq!(HealthStatus::derive(&connected, &[]), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::derive(
                &connected,
                &[issue(IssueKind::Performance, IssueSeverity::High)]
            ),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::derive(
                &connected,
                &[issue(IssueKind::Storage, IssueSeverity::Critical)]
            ),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::derive(
                &HealthMetrics::default(),
                &[issue(IssueKind::Connectivity, IssueSeverity::High)]
            ),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut metrics = HealthMetrics::default();
        metrics.record_failure();
        metrics.record_failure();
        assert_eq!(metrics.consecutive_failures, 2);
        assert!(!metrics.is_connected);

        let at = Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap();
        metrics.record_success(at, Some(42));
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.is_connected);
        assert_eq!(metrics.last_successful_operation, Some(at));
        metrics.record_success(at, None);
        assert_eq!(metrics.last_response_time_ms, Some(42));
    }

    #[test]
    fn quota_percentage_and_availability() {
        let quota = StorageQuota::from(QuotaEstimate {
            usage: 850,
            quota: 1_000,
        });
        assert_eq!(quota.available, 150);
        assert!((quota.percentage - 85.0).abs() < 1e-9);
        let overfull = StorageQuota::from(QuotaEstimate {
            usage: 10,
            quota: 0,
        });
        assert_eq!(overfull.available, 0);
        assert_eq!(overfull.percentage, 100.0);
    }

    #[test]
    fn issue_serializes_kind_as_type() {
        let value = serde_json::to_value(HealthIssue {
            error_kind: Some(ErrorKind::NetworkError),
            ..issue(IssueKind::Connectivity, IssueSeverity::Critical)
        })
        .expect("serialize");
        assert_eq!(value["type"], json!("connectivity"));
        assert_eq!(value["severity"], json!("critical"));
        assert_eq!(value["errorKind"], json!("network_error"));
    }
}
