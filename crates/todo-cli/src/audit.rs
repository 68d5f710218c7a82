use crate::Config;
use anyhow::{Context, Result};
use todo_core::audit::{AuditAction, AuditFilter, AuditSource};
use todo_storage::UserStores;

pub fn list(
    config: &Config,
    user: &str,
    source: Option<AuditSource>,
    action: Option<AuditAction>,
    entity_id: Option<String>,
    limit: usize,
) -> Result<()> {
    let stores = UserStores::open(&config.data_dir, user, &config.naming)
        .with_context(|| format!("failed to open stores for {user}"))?;
    let entries = stores.audit().entries().context("failed to read audit ledger")?;
    let filter = AuditFilter {
        source,
        action,
        entity_id,
    };

    for entry in filter.apply(&entries).into_iter().take(limit) {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}
