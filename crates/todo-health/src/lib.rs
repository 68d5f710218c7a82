//! Background health monitoring for a user's document store.

pub mod classify;
pub mod config;
pub mod monitor;
pub mod probe;
pub mod sqlite;
pub mod types;

pub use classify::{classify_failure, ErrorKind};
pub use config::HealthConfig;
pub use monitor::{HealthMonitor, ListenerId};
pub use probe::{ProbeFailure, QuotaEstimate, QuotaSource, QuotaUnavailable, StoreProbe};
pub use sqlite::{SqliteQuotaSource, SqliteStoreProbe};
pub use types::{
    HealthCheck, HealthIssue, HealthMetrics, HealthStatus, IssueKind, IssueSeverity, StorageQuota,
    SyncStatus,
};
