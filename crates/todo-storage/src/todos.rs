//! Todo reads and writes for one user.
//!
//! Reads migrate every document to the current schema before handing it out.
//! Writes always persist the current schema, append one audit entry per
//! successful mutation, and report store latency to the attached observer.

use crate::clock::MonotonicClock;
use crate::users::UserStores;
use crate::{serialization_error, StorageError};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use todo_core::attachment::{
    build_attachment_key, build_content_doc_id, check_attachment, decode_base64_payload,
    hash_bytes, AttachmentKind, DEFAULT_BLOB_NAMESPACE,
};
use todo_core::audit::{AuditAction, AuditSource, NewAuditEntry};
use todo_core::schema::todo::TODO_KIND;
use todo_core::schema::{
    iso_timestamp, migrate_to_latest, AttachmentRef, TimeEntry, Todo, TodoDocument, TodoNote,
    TODO_ALPHA3,
};
use todo_core::{NoopObserver, OperationObserver};
use tracing::{debug, warn};

/// A base64 payload destined for a todo's description or one of its notes.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub kind: AttachmentKind,
    pub filename: String,
    pub note_id: Option<String>,
    pub content_type: String,
    pub payload_base64: String,
}

pub struct TodoRepository<'a> {
    stores: &'a UserStores,
    observer: Arc<dyn OperationObserver>,
    source: AuditSource,
    ids: MonotonicClock,
}

impl<'a> TodoRepository<'a> {
    pub fn new(stores: &'a UserStores) -> Self {
        Self {
            stores,
            observer: Arc::new(NoopObserver),
            source: AuditSource::Web,
            ids: MonotonicClock::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn OperationObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Surface recorded on every audit entry this repository writes.
    pub fn with_source(mut self, source: AuditSource) -> Self {
        self.source = source;
        self
    }

    pub fn get(&self, id: &str) -> Result<Option<Todo>, StorageError> {
        let raw = self.observe(|| self.stores.entities().get(id))?;
        raw.as_ref().map(read_todo).transpose()
    }

    pub fn require(&self, id: &str) -> Result<Todo, StorageError> {
        self.get(id)?
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })
    }

    /// All todos, oldest first. A document that fails to migrate fails the
    /// whole read.
    pub fn list(&self) -> Result<Vec<Todo>, StorageError> {
        let docs = self.observe(|| self.stores.entities().all_docs())?;
        docs.iter().map(read_todo).collect()
    }

    pub fn create(&self, title: &str) -> Result<Todo, StorageError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StorageError::InvalidDocument(
                "todo title is empty".to_string(),
            ));
        }
        let todo = Todo::new(self.ids.next_id(Utc::now()), title);
        self.insert(todo)
    }

    /// Writes a todo built elsewhere, keeping its id.
    pub fn insert(&self, mut todo: Todo) -> Result<Todo, StorageError> {
        if todo.rev.is_some() {
            return Err(StorageError::Conflict { id: todo.id });
        }
        ensure_latest(&todo)?;
        let after = snapshot(&todo)?;
        todo.rev = Some(self.write(&todo)?);
        self.record(
            NewAuditEntry::new(AuditAction::Create, TODO_KIND, &todo.id, self.source)
                .with_after(after),
        )?;
        Ok(todo)
    }

    /// Replaces a todo. The caller's `_rev` must match the stored one.
    pub fn update(&self, mut todo: Todo) -> Result<Todo, StorageError> {
        ensure_latest(&todo)?;
        let before = self.require(&todo.id)?;
        let (before, after) = changed_fields(&snapshot(&before)?, &snapshot(&todo)?);
        todo.rev = Some(self.write(&todo)?);
        self.record(
            NewAuditEntry::new(AuditAction::Update, TODO_KIND, &todo.id, self.source)
                .with_before(before)
                .with_after(after),
        )?;
        Ok(todo)
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let before = self.require(id)?;
        let rev = before.rev.clone().unwrap_or_default();
        let snapshot_before = snapshot(&before)?;
        self.observe(|| self.stores.entities().remove(id, &rev))?;
        self.record(
            NewAuditEntry::new(AuditAction::Delete, TODO_KIND, id, self.source)
                .with_before(snapshot_before),
        )?;
        Ok(())
    }

    pub fn complete(&self, id: &str) -> Result<Todo, StorageError> {
        self.mutate(id, AuditAction::Complete, |todo, now| {
            if todo.completed {
                return Ok(false);
            }
            todo.completed = true;
            todo.completed_at = Some(now.to_string());
            Ok(true)
        })
    }

    pub fn uncomplete(&self, id: &str) -> Result<Todo, StorageError> {
        self.mutate(id, AuditAction::Uncomplete, |todo, _| {
            if !todo.completed {
                return Ok(false);
            }
            todo.completed = false;
            todo.completed_at = None;
            Ok(true)
        })
    }

    pub fn start_time_tracking(&self, id: &str) -> Result<Todo, StorageError> {
        self.mutate(id, AuditAction::TimeTrackingStart, |todo, now| {
            if todo.is_tracking() {
                return Err(StorageError::InvalidState(format!(
                    "todo {} is already tracking time",
                    todo.id
                )));
            }
            todo.time_tracking.push(TimeEntry {
                start: now.to_string(),
                end: None,
            });
            Ok(true)
        })
    }

    pub fn stop_time_tracking(&self, id: &str) -> Result<Todo, StorageError> {
        self.mutate(id, AuditAction::TimeTrackingStop, |todo, now| {
            let todo_id = todo.id.clone();
            let active = todo
                .time_tracking
                .iter_mut()
                .rev()
                .find(|entry| entry.end.is_none())
                .ok_or_else(|| {
                    StorageError::InvalidState(format!("todo {todo_id} is not tracking time"))
                })?;
            active.end = Some(now.to_string());
            Ok(true)
        })
    }

    pub fn add_note(&self, id: &str, text: &str) -> Result<Todo, StorageError> {
        let note_id = self.ids.next_id(Utc::now());
        self.mutate(id, AuditAction::Update, |todo, now| {
            todo.notes.push(TodoNote {
                id: note_id,
                text: text.to_string(),
                created_at: now.to_string(),
            });
            Ok(true)
        })
    }

    /// Validates and stores an upload, then links it from the todo. Identical
    /// bytes share one blob no matter how many todos reference them.
    pub fn add_attachment(
        &self,
        id: &str,
        upload: AttachmentUpload,
    ) -> Result<AttachmentRef, StorageError> {
        let bytes = decode_base64_payload(&upload.payload_base64)?;
        check_attachment(bytes.len() as i64, &upload.content_type)?;
        let key = build_attachment_key(upload.kind, &upload.filename, upload.note_id.as_deref())?;
        let todo = self.require(id)?;
        if let (AttachmentKind::Note, Some(note_id)) = (upload.kind, upload.note_id.as_deref()) {
            if !todo.notes.iter().any(|note| note.id == note_id) {
                return Err(StorageError::NotFound {
                    id: format!("{id}#{note_id}"),
                });
            }
        }

        let digest = hash_bytes(&bytes);
        let blob_id = build_content_doc_id(DEFAULT_BLOB_NAMESPACE, &digest)?;
        let inserted =
            self.observe(|| self.stores.entities().put_blob(&blob_id, &upload.content_type, &bytes))?;
        debug!(event = "attachment_blob", blob_id = %blob_id, inserted);

        let reference = AttachmentRef {
            key,
            content_type: upload.content_type,
            size: bytes.len() as u64,
            digest: Some(digest),
        };
        let linked = reference.clone();
        self.apply(todo, AuditAction::Update, move |todo, _| {
            todo.attachments.retain(|existing| existing.key != linked.key);
            todo.attachments.push(linked);
            Ok(true)
        })?;
        Ok(reference)
    }

    /// Reads a todo, applies `change`, and persists it when `change` reports
    /// a modification. Unchanged todos are returned without a write or an
    /// audit entry.
    fn mutate<F>(&self, id: &str, action: AuditAction, change: F) -> Result<Todo, StorageError>
    where
        F: FnOnce(&mut Todo, &str) -> Result<bool, StorageError>,
    {
        let todo = self.require(id)?;
        self.apply(todo, action, change)
    }

    fn apply<F>(&self, mut todo: Todo, action: AuditAction, change: F) -> Result<Todo, StorageError>
    where
        F: FnOnce(&mut Todo, &str) -> Result<bool, StorageError>,
    {
        let before = snapshot(&todo)?;
        let now = iso_timestamp(Utc::now());
        if !change(&mut todo, &now)? {
            return Ok(todo);
        }

        let (before, after) = changed_fields(&before, &snapshot(&todo)?);
        todo.rev = Some(self.write(&todo)?);
        self.record(
            NewAuditEntry::new(action, TODO_KIND, &todo.id, self.source)
                .with_before(before)
                .with_after(after),
        )?;
        Ok(todo)
    }

    fn write(&self, todo: &Todo) -> Result<String, StorageError> {
        let value = serde_json::to_value(todo).map_err(serialization_error)?;
        Ok(self.observe(|| self.stores.entities().put(&value))?.rev)
    }

    fn record(&self, entry: NewAuditEntry) -> Result<(), StorageError> {
        let entity_id = entry.entity_id.clone();
        if let Err(err) = self.stores.audit().append(entry) {
            warn!(
                event = "audit_append_failed",
                username = %self.stores.username(),
                entity_id = %entity_id,
                error = %err
            );
            return Err(err);
        }
        Ok(())
    }

    fn observe<T>(
        &self,
        operation: impl FnOnce() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let started = Instant::now();
        let result = operation();
        match &result {
            Ok(_) => {
                let elapsed_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
                self.observer.record_success(Some(elapsed_ms));
            }
            Err(err) if err.is_store_failure() => self.observer.record_failure(),
            Err(_) => {}
        }
        result
    }
}

fn read_todo(raw: &Value) -> Result<Todo, StorageError> {
    Ok(migrate_to_latest::<TodoDocument>(raw)?)
}

/// Writes only ever persist the current schema.
fn ensure_latest(todo: &Todo) -> Result<(), StorageError> {
    if todo.version != TODO_ALPHA3 {
        return Err(StorageError::InvalidDocument(format!(
            "todo {} has version '{}', expected '{TODO_ALPHA3}'",
            todo.id, todo.version
        )));
    }
    Ok(())
}

/// Full document minus the store-owned revision.
fn snapshot(todo: &Todo) -> Result<Value, StorageError> {
    let mut value = todo.to_value().map_err(serialization_error)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("_rev");
    }
    Ok(value)
}

/// Reduces two snapshots to the top-level fields that differ.
fn changed_fields(before: &Value, after: &Value) -> (Value, Value) {
    let (Some(before), Some(after)) = (before.as_object(), after.as_object()) else {
        return (before.clone(), after.clone());
    };
    let mut partial_before = Map::new();
    let mut partial_after = Map::new();
    for key in before.keys().chain(after.keys()) {
        if before.get(key) == after.get(key) || partial_before.contains_key(key) {
            continue;
        }
        if let Some(value) = before.get(key) {
            partial_before.insert(key.clone(), value.clone());
        }
        if let Some(value) = after.get(key) {
            partial_after.insert(key.clone(), value.clone());
        }
    }
    (Value::Object(partial_before), Value::Object(partial_after))
}
