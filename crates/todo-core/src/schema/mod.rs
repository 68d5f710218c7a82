//! Versioned document kinds and the forward migration chain.
//!
//! Every persisted document carries a `version` tag. Each entity kind models
//! its historical shapes as a tagged union (legacy, every known tag, and an
//! explicit `Unknown` for tags written by newer clients) and knows how to take
//! exactly one step forward. [`migrate_to_latest`] walks that chain until the
//! latest shape is reached.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub mod todo;
pub mod user;

pub use todo::{
    AttachmentRef, LegacyTodo, TimeEntry, Todo, TodoAlpha1, TodoAlpha2, TodoAlpha3, TodoDocument,
    TodoNote, DEFAULT_TODO_CONTEXT, TODO_ALPHA1, TODO_ALPHA2, TODO_ALPHA3,
};
pub use user::{
    LegacyUser, UserAlpha1, UserAlpha2, UserRegistryDocument, UserRegistryEntry, USER_ALPHA1,
    USER_ALPHA2,
};

pub const VERSION_FIELD: &str = "version";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("invalid {kind} document shape: {reason}")]
    InvalidDocumentShape { kind: &'static str, reason: String },
    #[error("unsupported {kind} version '{found}' (latest known: {latest})")]
    UnsupportedVersion {
        kind: &'static str,
        found: String,
        latest: &'static str,
    },
}

impl MigrationError {
    pub fn shape(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidDocumentShape {
            kind,
            reason: reason.into(),
        }
    }
}

/// Inputs a migration may need besides the document itself.
///
/// Only legacy lifting reads the clock, to synthesize timestamps that
/// pre-versioning documents never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationContext {
    pub now: DateTime<Utc>,
}

impl MigrationContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn now_iso(&self) -> String {
        iso_timestamp(self.now)
    }
}

impl Default for MigrationContext {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

/// A document kind with an ordered chain of schema versions.
pub trait VersionedKind: Sized {
    const KIND: &'static str;
    /// Known tags, oldest first. The last entry is the current schema.
    const VERSIONS: &'static [&'static str];

    type Latest: Serialize + DeserializeOwned + Clone;

    /// Places a raw document on the chain without changing it.
    fn parse(raw: &Value) -> Result<Self, MigrationError>;

    /// Tag of the parsed shape; `None` for legacy documents.
    fn version(&self) -> Option<&str>;

    /// Takes exactly one step towards the latest version.
    fn upgrade(self, ctx: &MigrationContext) -> Result<Self, MigrationError>;

    /// Returns the latest shape, or hands the document back if it is older.
    fn into_latest(self) -> Result<Self::Latest, Self>;

    fn latest_version() -> &'static str {
        Self::VERSIONS[Self::VERSIONS.len() - 1]
    }
}

/// Migrates any historical shape of `K` to its latest version using the
/// current wall clock for legacy defaults.
pub fn migrate_to_latest<K: VersionedKind>(raw: &Value) -> Result<K::Latest, MigrationError> {
    migrate_to_latest_with::<K>(raw, &MigrationContext::default())
}

pub fn migrate_to_latest_with<K: VersionedKind>(
    raw: &Value,
    ctx: &MigrationContext,
) -> Result<K::Latest, MigrationError> {
    let mut document = K::parse(raw)?;
    // Legacy lift plus one step per known version bounds the walk.
    for _ in 0..=K::VERSIONS.len() {
        match document.into_latest() {
            Ok(latest) => return Ok(latest),
            Err(older) => document = older.upgrade(ctx)?,
        }
    }
    Err(MigrationError::shape(
        K::KIND,
        "migration chain did not reach the latest version",
    ))
}

/// True only when the document already satisfies the latest schema.
pub fn is_current<K: VersionedKind>(raw: &Value) -> bool {
    K::parse(raw)
        .map(|document| document.into_latest().is_ok())
        .unwrap_or(false)
}

/// Reads the raw `version` tag of a stored document, if it has one.
pub fn stored_version(raw: &Value) -> Option<&str> {
    raw.get(VERSION_FIELD).and_then(Value::as_str)
}

pub fn document_id(raw: &Value) -> Option<&str> {
    raw.get("_id").and_then(Value::as_str)
}

#[derive(Debug, Clone)]
pub struct MigrationFailure {
    pub id: Option<String>,
    pub version: Option<String>,
    pub error: MigrationError,
}

/// Outcome of migrating a batch of stored documents.
#[derive(Debug, Clone)]
pub struct MigrationBatch<L> {
    pub current: Vec<L>,
    pub upgraded: Vec<L>,
    pub failures: Vec<MigrationFailure>,
}

impl<L> Default for MigrationBatch<L> {
    fn default() -> Self {
        Self {
            current: Vec::new(),
            upgraded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<L> MigrationBatch<L> {
    pub fn total(&self) -> usize {
        self.current.len() + self.upgraded.len() + self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn migrate_batch<K: VersionedKind>(
    documents: &[Value],
    ctx: &MigrationContext,
) -> MigrationBatch<K::Latest> {
    let mut batch = MigrationBatch::default();
    for raw in documents {
        let already_current = is_current::<K>(raw);
        match migrate_to_latest_with::<K>(raw, ctx) {
            Ok(latest) if already_current => batch.current.push(latest),
            Ok(latest) => batch.upgraded.push(latest),
            Err(error) => batch.failures.push(MigrationFailure {
                id: document_id(raw).map(str::to_string),
                version: stored_version(raw).map(str::to_string),
                error,
            }),
        }
    }
    batch
}

pub fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn decode<T: DeserializeOwned>(
    kind: &'static str,
    raw: &Value,
) -> Result<T, MigrationError> {
    serde_json::from_value(raw.clone())
        .map_err(|err| MigrationError::shape(kind, err.to_string()))
}

pub(crate) fn as_object<'a>(
    kind: &'static str,
    raw: &'a Value,
) -> Result<&'a Map<String, Value>, MigrationError> {
    raw.as_object()
        .ok_or_else(|| MigrationError::shape(kind, "document is not a JSON object"))
}

/// Splits a document into its version tag and body.
///
/// `Ok(None)` means the document predates versioning.
pub(crate) fn version_tag<'a>(
    kind: &'static str,
    raw: &'a Value,
) -> Result<Option<&'a str>, MigrationError> {
    match as_object(kind, raw)?.get(VERSION_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(tag)) => Ok(Some(tag.as_str())),
        Some(other) => Err(MigrationError::shape(
            kind,
            format!("version tag must be a string, found {other}"),
        )),
    }
}

/// Promotes a field that an older schema carried as an unknown extra into a
/// typed field of the next schema.
///
/// A value that does not decode is kept under a `legacy_` prefixed key, so
/// `extra` never shadows a typed field once the document is serialized.
pub(crate) fn adopt<T: DeserializeOwned>(
    extra: &mut BTreeMap<String, Value>,
    key: &str,
) -> Option<T> {
    let value = extra.remove(key)?;
    if value.is_null() {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            let legacy = legacy_key(extra, key);
            extra.insert(legacy, value);
            None
        }
    }
}

fn legacy_key(extra: &BTreeMap<String, Value>, key: &str) -> String {
    let base = format!("legacy_{key}");
    let mut candidate = base.clone();
    let mut n = 2;
    while extra.contains_key(&candidate) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> MigrationContext {
        MigrationContext::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn iso_timestamp_uses_millisecond_precision_and_z_suffix() {
        assert_eq!(ctx().now_iso(), "2024-03-01T12:00:00.000Z");
    }

    #[test]
    fn non_object_documents_are_invalid_shapes() {
        for raw in [json!(null), json!(42), json!("todo"), json!([1, 2])] {
            let err = migrate_to_latest_with::<TodoDocument>(&raw, &ctx()).unwrap_err();
            assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
        }
    }

    #[test]
    fn numeric_version_tag_is_rejected_rather_than_guessed() {
        let raw = json!({"_id": "a", "version": 2, "title": "x"});
        let err = migrate_to_latest_with::<TodoDocument>(&raw, &ctx()).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
    }

    #[test]
    fn batch_separates_current_upgraded_and_failed_documents() {
        let docs = vec![
            json!({
                "_id": "2024-01-01T00:00:00.000Z",
                "version": "alpha3",
                "title": "current",
                "completed": false,
                "tags": [],
                "description": "",
                "links": [],
                "context": "inbox",
                "timeTracking": [],
                "notes": [],
                "attachments": []
            }),
            json!({"_id": "2024-01-02T00:00:00.000Z", "version": "alpha1", "title": "old"}),
            json!({"_id": "2024-01-03T00:00:00.000Z", "version": "alpha9", "title": "future"}),
        ];

        let batch = migrate_batch::<TodoDocument>(&docs, &ctx());
        assert_eq!(batch.current.len(), 1);
        assert_eq!(batch.upgraded.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.total(), 3);
        assert!(!batch.is_clean());
        let failure = &batch.failures[0];
        assert_eq!(failure.id.as_deref(), Some("2024-01-03T00:00:00.000Z"));
        assert_eq!(failure.version.as_deref(), Some("alpha9"));
        assert!(matches!(
            failure.error,
            MigrationError::UnsupportedVersion { .. }
        ));
    }

    #[test]
    fn stored_version_reads_tag_only_when_string() {
        assert_eq!(stored_version(&json!({"version": "alpha2"})), Some("alpha2"));
        assert_eq!(stored_version(&json!({"version": 2})), None);
        assert_eq!(stored_version(&json!({})), None);
    }
}
