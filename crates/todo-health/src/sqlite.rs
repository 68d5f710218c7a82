//! Probe and quota adapters for [`DocumentStore`].

use crate::probe::{ProbeFailure, QuotaEstimate, QuotaSource, QuotaUnavailable, StoreProbe};
use async_trait::async_trait;
use std::sync::Arc;
use todo_storage::{DocumentStore, StorageError, StoreInfo};

pub const DEFAULT_STORAGE_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

pub struct SqliteStoreProbe {
    store: Arc<DocumentStore>,
}

impl SqliteStoreProbe {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StoreProbe for SqliteStoreProbe {
    async fn info(&self) -> Result<StoreInfo, ProbeFailure> {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.info()).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(err)) => Err(probe_failure(err)),
            Err(join_err) => Err(ProbeFailure::Other(join_err.to_string())),
        }
    }
}

fn probe_failure(err: StorageError) -> ProbeFailure {
    if err.is_disk_full() {
        ProbeFailure::QuotaExceeded(err.to_string())
    } else if err.is_busy() {
        ProbeFailure::Network(err.to_string())
    } else {
        ProbeFailure::Other(err.to_string())
    }
}

/// Reports the database size against a fixed byte budget.
pub struct SqliteQuotaSource {
    store: Arc<DocumentStore>,
    budget_bytes: u64,
}

impl SqliteQuotaSource {
    pub fn new(store: Arc<DocumentStore>, budget_bytes: u64) -> Self {
        Self {
            store,
            budget_bytes,
        }
    }
}

#[async_trait]
impl QuotaSource for SqliteQuotaSource {
    async fn estimate(&self) -> Result<QuotaEstimate, QuotaUnavailable> {
        if self.budget_bytes == 0 {
            return Err(QuotaUnavailable("no storage budget configured".to_string()));
        }
        let store = Arc::clone(&self.store);
        let usage = tokio::task::spawn_blocking(move || store.size_bytes())
            .await
            .map_err(|err| QuotaUnavailable(err.to_string()))?
            .map_err(|err| QuotaUnavailable(err.to_string()))?;
        Ok(QuotaEstimate {
            usage,
            quota: self.budget_bytes,
        })
    }
}
