use crate::Config;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use todo_health::{HealthConfig, HealthMonitor, SqliteQuotaSource, SqliteStoreProbe};
use todo_storage::users::database_path;
use todo_storage::DocumentStore;
use tokio::sync::mpsc;
use tracing::info;

const BYTES_PER_MB: u64 = 1024 * 1024;

pub async fn watch(
    config: &Config,
    user: &str,
    interval_secs: u64,
    checks: Option<usize>,
    budget_mb: u64,
) -> Result<()> {
    let store_name = config.naming.entity_store(user)?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        DocumentStore::open(database_path(&config.data_dir, &store_name), store_name)
            .with_context(|| format!("failed to open store for {user}"))?,
    );

    let health_config =
        HealthConfig::default().with_check_interval(Duration::from_secs(interval_secs));
    let monitor = HealthMonitor::new(
        Arc::new(SqliteStoreProbe::new(Arc::clone(&store))),
        health_config,
    )
    .with_quota_source(Arc::new(SqliteQuotaSource::new(
        store,
        budget_mb.saturating_mul(BYTES_PER_MB),
    )));

    let (tx, mut rx) = mpsc::unbounded_channel();
    monitor.subscribe(move |check| {
        let _ = tx.send(check.clone());
    });
    monitor.start();
    info!(event = "health_watch_started", user = %user, interval_secs);

    let mut seen = 0usize;
    loop {
        tokio::select! {
            check = rx.recv() => {
                let Some(check) = check else { break };
                println!("{}", serde_json::to_string(&check)?);
                seen += 1;
                if checks.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(event = "health_watch_interrupted");
                break;
            }
        }
    }

    monitor.stop();
    Ok(())
}
