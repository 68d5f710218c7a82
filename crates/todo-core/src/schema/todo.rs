use super::{
    adopt, as_object, decode, version_tag, MigrationContext, MigrationError, VersionedKind,
    VERSION_FIELD,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const TODO_KIND: &str = "todo";
pub const TODO_ALPHA1: &str = "alpha1";
pub const TODO_ALPHA2: &str = "alpha2";
pub const TODO_ALPHA3: &str = "alpha3";
pub const DEFAULT_TODO_CONTEXT: &str = "inbox";

/// The current todo schema.
pub type Todo = TodoAlpha3;

/// Pre-versioning todo. Early clients wrote either `text` or `title` and
/// either `done` or `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTodo {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoAlpha1 {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoAlpha2 {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoNote {
    pub id: String,
    pub text: String,
    pub created_at: String,
}

/// Metadata for a binary stored under an attachment key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub key: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoAlpha3 {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub time_tracking: Vec<TimeEntry>,
    #[serde(default)]
    pub notes: Vec<TodoNote>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_context() -> String {
    DEFAULT_TODO_CONTEXT.to_string()
}

impl TodoAlpha3 {
    /// A fresh todo in the current schema. Write paths only ever build these.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            version: TODO_ALPHA3.to_string(),
            title: title.into(),
            completed: false,
            tags: Vec::new(),
            due: None,
            description: String::new(),
            completed_at: None,
            links: Vec::new(),
            context: default_context(),
            time_tracking: Vec::new(),
            notes: Vec::new(),
            attachments: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn active_time_entry(&self) -> Option<&TimeEntry> {
        self.time_tracking.iter().rev().find(|entry| entry.end.is_none())
    }

    pub fn is_tracking(&self) -> bool {
        self.active_time_entry().is_some()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

pub fn lift_legacy(
    legacy: LegacyTodo,
    ctx: &MigrationContext,
) -> Result<TodoAlpha1, MigrationError> {
    let LegacyTodo {
        id,
        rev,
        title,
        text,
        completed,
        done,
        tags,
        due,
        mut extra,
    } = legacy;
    extra.remove(VERSION_FIELD);

    let title = match (title, text) {
        (Some(title), text) if !title.trim().is_empty() => {
            if let Some(text) = text.filter(|text| *text != title) {
                extra.insert("text".to_string(), Value::String(text));
            }
            title
        }
        (_, Some(text)) if !text.trim().is_empty() => text,
        _ => {
            return Err(MigrationError::shape(
                TODO_KIND,
                "legacy todo has neither a title nor text",
            ))
        }
    };

    let completed = match (completed, done) {
        (Some(completed), Some(done)) => {
            if completed != done {
                extra.insert("done".to_string(), Value::Bool(done));
            }
            completed
        }
        (Some(flag), None) | (None, Some(flag)) => flag,
        (None, None) => false,
    };

    Ok(TodoAlpha1 {
        id: id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| ctx.now_iso()),
        rev,
        version: TODO_ALPHA1.to_string(),
        title,
        completed,
        tags,
        due,
        extra,
    })
}

pub fn migrate_alpha1_to_alpha2(doc: TodoAlpha1) -> TodoAlpha2 {
    let TodoAlpha1 {
        id,
        rev,
        version: _,
        title,
        completed,
        tags,
        due,
        mut extra,
    } = doc;
    let description = adopt(&mut extra, "description").unwrap_or_default();
    let completed_at = adopt(&mut extra, "completedAt");
    let links = adopt(&mut extra, "links").unwrap_or_default();
    TodoAlpha2 {
        id,
        rev,
        version: TODO_ALPHA2.to_string(),
        title,
        completed,
        tags,
        due,
        description,
        completed_at,
        links,
        extra,
    }
}

pub fn migrate_alpha2_to_alpha3(doc: TodoAlpha2) -> TodoAlpha3 {
    let TodoAlpha2 {
        id,
        rev,
        version: _,
        title,
        completed,
        tags,
        due,
        description,
        completed_at,
        links,
        mut extra,
    } = doc;
    let context = adopt(&mut extra, "context").unwrap_or_else(default_context);
    let time_tracking = adopt(&mut extra, "timeTracking").unwrap_or_default();
    let notes = adopt(&mut extra, "notes").unwrap_or_default();
    let attachments = adopt(&mut extra, "attachments").unwrap_or_default();
    TodoAlpha3 {
        id,
        rev,
        version: TODO_ALPHA3.to_string(),
        title,
        completed,
        tags,
        due,
        description,
        completed_at,
        links,
        context,
        time_tracking,
        notes,
        attachments,
        extra,
    }
}

/// Every todo shape ever persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum TodoDocument {
    Legacy(LegacyTodo),
    Alpha1(TodoAlpha1),
    Alpha2(TodoAlpha2),
    Alpha3(TodoAlpha3),
    Unknown { version: String },
}

impl VersionedKind for TodoDocument {
    const KIND: &'static str = TODO_KIND;
    const VERSIONS: &'static [&'static str] = &[TODO_ALPHA1, TODO_ALPHA2, TODO_ALPHA3];

    type Latest = Todo;

    fn parse(raw: &Value) -> Result<Self, MigrationError> {
        let document = match version_tag(TODO_KIND, raw)? {
            None => Self::Legacy(decode(TODO_KIND, raw)?),
            Some(TODO_ALPHA3) => Self::Alpha3(decode(TODO_KIND, raw)?),
            Some(TODO_ALPHA2) => Self::Alpha2(decode(TODO_KIND, raw)?),
            Some(TODO_ALPHA1) => Self::Alpha1(decode(TODO_KIND, raw)?),
            Some(other) => Self::Unknown {
                version: other.to_string(),
            },
        };
        if let Some(id) = as_object(TODO_KIND, raw)?.get("_id") {
            if !matches!(id, Value::String(id) if !id.is_empty()) {
                return Err(MigrationError::shape(
                    TODO_KIND,
                    "_id must be a non-empty string",
                ));
            }
        }
        Ok(document)
    }

    fn version(&self) -> Option<&str> {
        match self {
            Self::Legacy(_) => None,
            Self::Alpha1(_) => Some(TODO_ALPHA1),
            Self::Alpha2(_) => Some(TODO_ALPHA2),
            Self::Alpha3(_) => Some(TODO_ALPHA3),
            Self::Unknown { version } => Some(version.as_str()),
        }
    }

    fn upgrade(self, ctx: &MigrationContext) -> Result<Self, MigrationError> {
        match self {
            Self::Legacy(doc) => lift_legacy(doc, ctx).map(Self::Alpha1),
            Self::Alpha1(doc) => Ok(Self::Alpha2(migrate_alpha1_to_alpha2(doc))),
            Self::Alpha2(doc) => Ok(Self::Alpha3(migrate_alpha2_to_alpha3(doc))),
            Self::Alpha3(doc) => Ok(Self::Alpha3(doc)),
            Self::Unknown { version } => Err(MigrationError::UnsupportedVersion {
                kind: TODO_KIND,
                found: version,
                latest: TODO_ALPHA3,
            }),
        }
    }

    fn into_latest(self) -> Result<Todo, Self> {
        match self {
            Self::Alpha3(doc) => Ok(doc),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{is_current, migrate_to_latest_with};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn ctx() -> MigrationContext {
        MigrationContext::at(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    fn migrate(raw: &Value) -> Result<Todo, MigrationError> {
        migrate_to_latest_with::<TodoDocument>(raw, &ctx())
    }

    fn fixtures() -> Vec<Value> {
        vec![
            json!({"text": "buy milk", "done": true, "tags": ["home"]}),
            json!({"_id": "2023-01-05T08:00:00.000Z", "_rev": "3-abc", "title": "legacy titled"}),
            json!({
                "_id": "2023-02-01T10:00:00.000Z",
                "_rev": "1-aaa",
                "version": "alpha1",
                "title": "write report",
                "completed": false,
                "tags": ["work"],
                "due": "2023-02-10",
                "priority": "high"
            }),
            json!({
                "_id": "2023-06-01T10:00:00.000Z",
                "version": "alpha2",
                "title": "plan trip",
                "completed": true,
                "tags": [],
                "description": "book flights",
                "completedAt": "2023-06-03T09:00:00.000Z",
                "links": ["https://example.com/itinerary"]
            }),
            json!({
                "_id": "2024-01-01T10:00:00.000Z",
                "_rev": "7-fff",
                "version": "alpha3",
                "title": "review PR",
                "completed": false,
                "tags": ["code"],
                "description": "",
                "links": [],
                "context": "work",
                "timeTracking": [{"start": "2024-01-01T10:00:00.000Z"}],
                "notes": [{"id": "n1", "text": "ask about tests", "createdAt": "2024-01-01T10:05:00.000Z"}],
                "attachments": [{"key": "desc/diagram.png", "contentType": "image/png", "size": 2048}]
            }),
            json!({
                "_id": "2023-03-01T10:00:00.000Z",
                "version": "alpha1",
                "title": "imported with a numeric description",
                "description": 5,
                "completedAt": false,
                "links": "https://example.com"
            }),
            json!({
                "_id": "2023-07-01T10:00:00.000Z",
                "version": "alpha2",
                "title": "context written as a number",
                "context": 7,
                "timeTracking": {"start": "2023-07-01T10:00:00.000Z"},
                "notes": "call back",
                "attachments": null
            }),
        ]
    }

    #[test]
    fn every_fixture_reaches_latest_version() {
        for raw in fixtures() {
            let todo = migrate(&raw).expect("migrate fixture");
            assert_eq!(todo.version, TODO_ALPHA3, "fixture {raw}");
            assert!(is_current::<TodoDocument>(&todo.to_value().expect("serialize")));
        }
    }

    #[test]
    fn migration_is_idempotent() {
        for raw in fixtures() {
            let once = migrate(&raw).expect("first pass");
            let twice = migrate(&once.to_value().expect("serialize")).expect("second pass");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn legacy_text_and_done_are_lifted_with_synthesized_id() {
        let todo = migrate(&json!({"text": "buy milk", "done": true, "tags": ["home"]}))
            .expect("migrate legacy");
        assert_eq!(todo.id, "2024-03-01T12:00:00.000Z");
        assert_eq!(todo.title, "buy milk");
        assert!(todo.completed);
        assert_eq!(todo.tags, vec!["home".to_string()]);
        assert_eq!(todo.context, DEFAULT_TODO_CONTEXT);
        assert!(todo.extra.is_empty());
    }

    #[test]
    fn legacy_keeps_conflicting_fields_instead_of_dropping_them() {
        let todo = migrate(&json!({
            "_id": "x1",
            "title": "primary",
            "text": "secondary",
            "completed": false,
            "done": true
        }))
        .expect("migrate legacy");
        assert_eq!(todo.title, "primary");
        assert!(!todo.completed);
        assert_eq!(todo.extra.get("text"), Some(&json!("secondary")));
        assert_eq!(todo.extra.get("done"), Some(&json!(true)));
    }

    #[test]
    fn legacy_without_any_title_is_invalid() {
        let err = migrate(&json!({"_id": "x", "done": false})).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
        let err = migrate(&json!({"text": "   "})).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
    }

    #[test]
    fn alpha1_fields_survive_to_alpha3_and_unknown_fields_are_preserved() {
        let todo = migrate(&fixtures()[2]).expect("migrate alpha1");
        assert_eq!(todo.id, "2023-02-01T10:00:00.000Z");
        assert_eq!(todo.rev.as_deref(), Some("1-aaa"));
        assert_eq!(todo.title, "write report");
        assert_eq!(todo.due.as_deref(), Some("2023-02-10"));
        assert_eq!(todo.description, "");
        assert!(todo.links.is_empty());
        assert_eq!(todo.extra.get("priority"), Some(&json!("high")));
    }

    #[test]
    fn fields_written_ahead_of_their_schema_are_adopted() {
        let todo = migrate(&json!({
            "_id": "a",
            "version": "alpha1",
            "title": "early adopter",
            "description": "set by a newer screen",
            "context": "errands"
        }))
        .expect("migrate");
        assert_eq!(todo.description, "set by a newer screen");
        assert_eq!(todo.context, "errands");
        assert!(!todo.extra.contains_key("description"));
        assert!(!todo.extra.contains_key("context"));
    }

    #[test]
    fn mistyped_early_fields_move_aside_instead_of_shadowing_typed_ones() {
        let todo = migrate(&fixtures()[5]).expect("migrate mistyped alpha1");
        assert_eq!(todo.description, "");
        assert_eq!(todo.completed_at, None);
        assert!(todo.links.is_empty());
        assert_eq!(todo.extra.get("legacy_description"), Some(&json!(5)));
        assert_eq!(todo.extra.get("legacy_completedAt"), Some(&json!(false)));
        assert_eq!(
            todo.extra.get("legacy_links"),
            Some(&json!("https://example.com"))
        );
        for key in ["description", "completedAt", "links"] {
            assert!(!todo.extra.contains_key(key), "{key} left in extra");
        }

        let value = todo.to_value().expect("serialize");
        assert_eq!(value["description"], json!(""));
        assert!(is_current::<TodoDocument>(&value));
    }

    #[test]
    fn mistyped_alpha3_fields_keep_their_defaults() {
        let todo = migrate(&fixtures()[6]).expect("migrate mistyped alpha2");
        assert_eq!(todo.context, DEFAULT_TODO_CONTEXT);
        assert!(todo.time_tracking.is_empty());
        assert!(todo.notes.is_empty());
        assert!(todo.attachments.is_empty());
        assert_eq!(todo.extra.get("legacy_context"), Some(&json!(7)));
        assert_eq!(todo.extra.get("legacy_notes"), Some(&json!("call back")));
        assert!(!todo.extra.contains_key("attachments"));
        assert!(!todo.extra.contains_key("legacy_attachments"));
    }

    #[test]
    fn moved_aside_value_does_not_clobber_an_existing_legacy_key() {
        let todo = migrate(&json!({
            "_id": "a",
            "version": "alpha2",
            "title": "t",
            "context": 7,
            "legacy_context": "kept"
        }))
        .expect("migrate");
        assert_eq!(todo.extra.get("legacy_context"), Some(&json!("kept")));
        assert_eq!(todo.extra.get("legacy_context_2"), Some(&json!(7)));
    }

    #[test]
    fn alpha2_completion_metadata_is_kept() {
        let todo = migrate(&fixtures()[3]).expect("migrate alpha2");
        assert!(todo.completed);
        assert_eq!(
            todo.completed_at.as_deref(),
            Some("2023-06-03T09:00:00.000Z")
        );
        assert_eq!(todo.description, "book flights");
        assert_eq!(todo.links.len(), 1);
    }

    #[test]
    fn current_document_is_returned_unchanged() {
        let raw = fixtures()[4].clone();
        let todo = migrate(&raw).expect("migrate alpha3");
        assert_eq!(todo.to_value().expect("serialize"), raw);
        assert!(todo.is_tracking());
    }

    #[test]
    fn unknown_version_fails_loudly() {
        let err = migrate(&json!({"_id": "a", "version": "alpha4", "title": "from the future"}))
            .unwrap_err();
        assert_eq!(
            err,
            MigrationError::UnsupportedVersion {
                kind: TODO_KIND,
                found: "alpha4".to_string(),
                latest: TODO_ALPHA3,
            }
        );
        assert!(!is_current::<TodoDocument>(&json!({"version": "alpha4"})));
    }

    #[test]
    fn known_tag_with_wrong_body_is_invalid_shape() {
        let err = migrate(&json!({"_id": "a", "version": "alpha2", "completed": true})).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
        let err = migrate(&json!({"_id": "", "version": "alpha1", "title": "t"})).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidDocumentShape { .. }));
    }

    #[test]
    fn only_latest_predicate_counts_as_current() {
        assert!(!is_current::<TodoDocument>(&fixtures()[3]));
        assert!(is_current::<TodoDocument>(&fixtures()[4]));
        assert_eq!(TodoDocument::latest_version(), TODO_ALPHA3);
    }
}
