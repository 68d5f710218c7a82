use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use todo_storage::StoreInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Cheap liveness query against the store.
#[async_trait]
pub trait StoreProbe: Send + Sync {
    async fn info(&self) -> Result<StoreInfo, ProbeFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEstimate {
    pub usage: u64,
    pub quota: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage quota unavailable: {0}")]
pub struct QuotaUnavailable(pub String);

/// Advisory storage usage. Failures here never fail a health check.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn estimate(&self) -> Result<QuotaEstimate, QuotaUnavailable>;
}
