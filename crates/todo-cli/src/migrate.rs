use crate::{Config, DocumentKind};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use todo_core::audit::{AuditAction, AuditSource, NewAuditEntry};
use todo_core::schema::todo::TODO_KIND;
use todo_core::schema::{
    document_id, migrate_batch, stored_version, MigrationBatch, MigrationContext, TodoDocument,
    UserRegistryDocument, VersionedKind,
};
use todo_storage::{DocumentStore, UserRegistry, UserStores};
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationReport {
    kind: &'static str,
    store: String,
    latest_version: &'static str,
    total: usize,
    current: usize,
    upgraded: usize,
    written: usize,
    failures: Vec<FailureReport>,
}

#[derive(Debug, Serialize)]
struct FailureReport {
    id: Option<String>,
    version: Option<String>,
    error: String,
}

pub fn run(
    config: &Config,
    user: &str,
    kind: DocumentKind,
    write: bool,
    source: AuditSource,
) -> Result<()> {
    let ctx = MigrationContext::default();
    let report = match kind {
        DocumentKind::Todo => {
            let stores = UserStores::open(&config.data_dir, user, &config.naming)
                .with_context(|| format!("failed to open stores for {user}"))?;
            let docs = stores.entities().all_docs()?;
            let batch = migrate_batch::<TodoDocument>(&docs, &ctx);
            let written = if write {
                persist_todos(&stores, &docs, &batch, source)?
            } else {
                0
            };
            report::<TodoDocument>(stores.entities(), &batch, written)
        }
        DocumentKind::User => {
            let registry =
                UserRegistry::open(&config.data_dir).context("failed to open user registry")?;
            let docs = registry.store().all_docs()?;
            let batch = migrate_batch::<UserRegistryDocument>(&docs, &ctx);
            let mut written = 0;
            if write {
                for entry in &batch.upgraded {
                    registry.store().put(&serde_json::to_value(entry)?)?;
                    written += 1;
                }
            }
            report::<UserRegistryDocument>(registry.store(), &batch, written)
        }
    };

    info!(
        event = "migration_finished",
        kind = report.kind,
        store = %report.store,
        upgraded = report.upgraded,
        written = report.written,
        failures = report.failures.len()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Writes each upgraded todo back and records the upgrade in the ledger.
fn persist_todos(
    stores: &UserStores,
    docs: &[Value],
    batch: &MigrationBatch<<TodoDocument as VersionedKind>::Latest>,
    source: AuditSource,
) -> Result<usize> {
    let previous_versions = docs
        .iter()
        .filter_map(|doc| {
            let id = document_id(doc)?;
            Some((id.to_string(), stored_version(doc).map(str::to_string)))
        })
        .collect::<HashMap<_, _>>();

    let mut written = 0;
    for todo in &batch.upgraded {
        stores
            .entities()
            .put(&serde_json::to_value(todo)?)
            .with_context(|| format!("failed to write {}", todo.id))?;
        let from = previous_versions.get(&todo.id).cloned().flatten();
        stores.audit().append(
            NewAuditEntry::new(AuditAction::Update, TODO_KIND, &todo.id, source)
                .with_before(json!({ "version": from }))
                .with_after(json!({ "version": todo.version }))
                .with_message("schema upgrade"),
        )?;
        written += 1;
    }
    Ok(written)
}

fn report<K: VersionedKind>(
    store: &DocumentStore,
    batch: &MigrationBatch<K::Latest>,
    written: usize,
) -> MigrationReport {
    MigrationReport {
        kind: K::KIND,
        store: store.name().to_string(),
        latest_version: K::latest_version(),
        total: batch.total(),
        current: batch.current.len(),
        upgraded: batch.upgraded.len(),
        written,
        failures: batch
            .failures
            .iter()
            .map(|failure| FailureReport {
                id: failure.id.clone(),
                version: failure.version.clone(),
                error: failure.error.to_string(),
            })
            .collect(),
    }
}
