use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const AUDIT_VERSION: &str = "audit_alpha1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Complete,
    Uncomplete,
    TimeTrackingStart,
    TimeTrackingStop,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Complete => "complete",
            AuditAction::Uncomplete => "uncomplete",
            AuditAction::TimeTrackingStart => "time_tracking_start",
            AuditAction::TimeTrackingStop => "time_tracking_stop",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "create" => Ok(AuditAction::Create),
            "update" => Ok(AuditAction::Update),
            "delete" => Ok(AuditAction::Delete),
            "complete" => Ok(AuditAction::Complete),
            "uncomplete" => Ok(AuditAction::Uncomplete),
            "time_tracking_start" => Ok(AuditAction::TimeTrackingStart),
            "time_tracking_stop" => Ok(AuditAction::TimeTrackingStop),
            other => Err(format!("Unknown audit action: {other}")),
        }
    }
}

/// The surface a mutation came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditSource {
    Web,
    Mcp,
    Telegram,
    GithubSync,
    RssSync,
    EmailSync,
}

impl AuditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSource::Web => "web",
            AuditSource::Mcp => "mcp",
            AuditSource::Telegram => "telegram",
            AuditSource::GithubSync => "github-sync",
            AuditSource::RssSync => "rss-sync",
            AuditSource::EmailSync => "email-sync",
        }
    }
}

impl fmt::Display for AuditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditSource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "web" => Ok(AuditSource::Web),
            "mcp" => Ok(AuditSource::Mcp),
            "telegram" => Ok(AuditSource::Telegram),
            "github-sync" => Ok(AuditSource::GithubSync),
            "rss-sync" => Ok(AuditSource::RssSync),
            "email-sync" => Ok(AuditSource::EmailSync),
            other => Err(format!("Unknown audit source: {other}")),
        }
    }
}

/// What a caller hands to the ledger. Identity and time are assigned there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAuditEntry {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub source: AuditSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewAuditEntry {
    pub fn new(
        action: AuditAction,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        source: AuditSource,
    ) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            source,
            before: None,
            after: None,
            message: None,
            metadata: None,
        }
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn into_entry(self, id: String) -> AuditEntry {
        AuditEntry {
            timestamp: id.clone(),
            id,
            rev: None,
            version: AUDIT_VERSION.to_string(),
            action: self.action,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            source: self.source,
            before: self.before,
            after: self.after,
            message: self.message,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub timestamp: String,
    pub source: AuditSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

pub fn is_current_audit_version(raw: &Value) -> bool {
    raw.get("version").and_then(Value::as_str) == Some(AUDIT_VERSION)
}

/// Client-side selection over ledger reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub source: Option<AuditSource>,
    pub action: Option<AuditAction>,
    pub entity_id: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.source.map_or(true, |source| entry.source == source)
            && self.action.map_or(true, |action| entry.action == action)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |entity_id| entry.entity_id == entity_id)
    }

    pub fn apply<'a>(&self, entries: &'a [AuditEntry]) -> Vec<&'a AuditEntry> {
        entries.iter().filter(|entry| self.matches(entry)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(action: AuditAction, source: AuditSource, entity_id: &str) -> AuditEntry {
        NewAuditEntry::new(action, "todo", entity_id, source)
            .into_entry("2024-01-01T00:00:00.000Z".to_string())
    }

    #[test]
    fn entry_serializes_with_wire_names() {
        let entry = NewAuditEntry::new(
            AuditAction::TimeTrackingStart,
            "todo",
            "2024-01-01T09:00:00.000Z",
            AuditSource::GithubSync,
        )
        .with_after(json!({"timeTracking": [{"start": "2024-01-01T09:30:00.000Z"}]}))
        .with_message("started from sync")
        .into_entry("2024-01-01T09:30:00.000Z".to_string());

        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["_id"], json!("2024-01-01T09:30:00.000Z"));
        assert_eq!(value["timestamp"], value["_id"]);
        assert_eq!(value["version"], json!(AUDIT_VERSION));
        assert_eq!(value["action"], json!("time_tracking_start"));
        assert_eq!(value["source"], json!("github-sync"));
        assert_eq!(value["entityType"], json!("todo"));
        assert!(value.get("before").is_none());
        assert!(is_current_audit_version(&value));

        let decoded: AuditEntry = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn version_guard_rejects_other_tags() {
        assert!(!is_current_audit_version(&json!({"version": "alpha3"})));
        assert!(!is_current_audit_version(&json!({})));
    }

    #[test]
    fn action_and_source_parse_from_cli_spellings() {
        assert_eq!(
            "time-tracking-stop".parse::<AuditAction>(),
            Ok(AuditAction::TimeTrackingStop)
        );
        assert_eq!("rss_sync".parse::<AuditSource>(), Ok(AuditSource::RssSync));
        assert!("fax".parse::<AuditSource>().is_err());
    }

    #[test]
    fn filter_matches_on_every_given_field() {
        let entries = vec![
            entry(AuditAction::Create, AuditSource::Web, "a"),
            entry(AuditAction::Complete, AuditSource::Web, "a"),
            entry(AuditAction::Create, AuditSource::Telegram, "b"),
        ];
        let by_source = AuditFilter {
            source: Some(AuditSource::Web),
            ..AuditFilter::default()
        };
        assert_eq!(by_source.apply(&entries).len(), 2);

        let by_action_and_entity = AuditFilter {
            action: Some(AuditAction::Create),
            entity_id: Some("b".to_string()),
            ..AuditFilter::default()
        };
        let selected = by_action_and_entity.apply(&entries);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].source, AuditSource::Telegram);
        assert_eq!(AuditFilter::default().apply(&entries).len(), 3);
    }
}
