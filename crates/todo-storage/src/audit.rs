//! Per-user append-only audit ledger.
//!
//! The ledger lives in its own database, separate from the entity store. It
//! offers no update or delete operation, and the table itself refuses both.

use crate::clock::MonotonicClock;
use crate::{is_constraint_violation, lock, serialization_error, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use todo_core::audit::{is_current_audit_version, AuditEntry, NewAuditEntry};
use tracing::{info, warn};

pub const AUDIT_SCHEMA_VERSION: i64 = 1;

pub struct AuditLedger {
    name: String,
    conn: Mutex<Connection>,
    clock: MonotonicClock,
}

impl AuditLedger {
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, name.into())
    }

    pub fn open_in_memory(name: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, name.into())
    }

    fn from_connection(conn: Connection, name: String) -> Result<Self, StorageError> {
        let mut ledger = Self {
            name,
            conn: Mutex::new(conn),
            clock: MonotonicClock::new(),
        };
        ledger.migrate()?;
        // Reopening a ledger must not reissue ids already on disk.
        if let Some(last) = ledger.latest_timestamp()? {
            ledger.clock = MonotonicClock::starting_after(last);
        }
        Ok(ledger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > AUDIT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: AUDIT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn();
            let sql = include_str!("../migrations/0001_audit_ledger.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Records a mutation. The ledger assigns `_id`, `timestamp` and
    /// `version`.
    pub fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, StorageError> {
        self.append_at(entry, Utc::now())
    }

    pub fn append_at(
        &self,
        entry: NewAuditEntry,
        now: DateTime<Utc>,
    ) -> Result<AuditEntry, StorageError> {
        let entry = entry.into_entry(self.clock.next_id(now));
        let body_json = serde_json::to_string(&entry).map_err(serialization_error)?;

        let inserted = self.conn().execute(
            "
            INSERT INTO audit_entries (
                id,
                timestamp,
                version,
                action,
                source,
                entity_type,
                entity_id,
                body_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                entry.id,
                entry.timestamp,
                entry.version,
                entry.action.as_str(),
                entry.source.as_str(),
                entry.entity_type,
                entry.entity_id,
                body_json,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_constraint_violation(&err) => {
                return Err(StorageError::AppendOnly { id: entry.id });
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            event = "audit_appended",
            ledger = %self.name,
            id = %entry.id,
            action = %entry.action,
            source = %entry.source,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id
        );
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<Option<AuditEntry>, StorageError> {
        let body_json: Option<String> = self
            .conn()
            .query_row(
                "SELECT body_json FROM audit_entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match body_json {
            Some(body_json) => self.decode(&body_json),
            None => Ok(None),
        }
    }

    /// All entries, newest first.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            "SELECT body_json FROM audit_entries ORDER BY timestamp DESC, id DESC",
            &[],
        )
    }

    /// History of one entity, newest first.
    pub fn entries_for(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        self.query(
            "
            SELECT body_json FROM audit_entries
            WHERE entity_type = ?1 AND entity_id = ?2
            ORDER BY timestamp DESC, id DESC
            ",
            &[&entity_type, &entity_id],
        )
    }

    pub fn len(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn query(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let mut bodies = Vec::new();
        {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            for body in stmt.query_map(args, |row| row.get::<_, String>(0))? {
                bodies.push(body?);
            }
        }

        let mut entries = Vec::with_capacity(bodies.len());
        for body_json in bodies {
            if let Some(entry) = self.decode(&body_json)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn decode(&self, body_json: &str) -> Result<Option<AuditEntry>, StorageError> {
        let value: Value = serde_json::from_str(body_json).map_err(serialization_error)?;
        if !is_current_audit_version(&value) {
            warn!(
                event = "audit_entry_skipped",
                ledger = %self.name,
                version = ?value.get("version"),
                "audit entry has an unrecognized version tag"
            );
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(serialization_error)
    }

    fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let latest: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM audit_entries ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(latest
            .and_then(|id| DateTime::parse_from_rfc3339(&id).ok())
            .map(|ts| ts.with_timezone(&Utc)))
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, rusqlite::Error> {
        self.conn().execute(sql, [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use todo_core::audit::{AuditAction, AuditSource, AUDIT_VERSION};

    fn ledger() -> AuditLedger {
        AuditLedger::open_in_memory("todos_audit_ada").expect("open ledger")
    }

    fn create(entity_id: &str) -> NewAuditEntry {
        NewAuditEntry::new(AuditAction::Create, "todo", entity_id, AuditSource::Web)
    }

    #[test]
    fn append_assigns_identity_and_reads_back_equal() {
        let ledger = ledger();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let written = ledger
            .append_at(
                create("t1")
                    .with_after(json!({"title": "buy milk"}))
                    .with_metadata(json!({"client": "test"})),
                now,
            )
            .expect("append");

        assert_eq!(written.id, "2024-06-01T09:00:00.000Z");
        assert_eq!(written.timestamp, written.id);
        assert_eq!(written.version, AUDIT_VERSION);

        let read = ledger.get(&written.id).expect("get").expect("present");
        assert_eq!(read, written);
        assert!(ledger.get("2020-01-01T00:00:00.000Z").expect("get").is_none());
    }

    #[test]
    fn rapid_appends_get_distinct_ids_and_read_newest_first() {
        let ledger = ledger();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        for entity in ["a", "b", "c"] {
            ledger.append_at(create(entity), now).expect("append");
        }

        let entries = ledger.entries().expect("entries");
        let ids = entries.iter().map(|entry| entry.id.as_str()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                "2024-06-01T09:00:00.002Z",
                "2024-06-01T09:00:00.001Z",
                "2024-06-01T09:00:00.000Z",
            ]
        );
        assert_eq!(entries[0].entity_id, "c");
        assert_eq!(ledger.len().expect("len"), 3);
    }

    #[test]
    fn entries_for_selects_one_entity() {
        let ledger = ledger();
        ledger.append(create("a")).expect("a");
        ledger.append(create("b")).expect("b");
        ledger
            .append(NewAuditEntry::new(
                AuditAction::Complete,
                "todo",
                "a",
                AuditSource::Mcp,
            ))
            .expect("complete a");

        let history = ledger.entries_for("todo", "a").expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Complete);
        assert!(ledger.entries_for("user", "a").expect("none").is_empty());
    }

    #[test]
    fn table_rejects_update_and_delete() {
        let ledger = ledger();
        let entry = ledger.append(create("a")).expect("append");

        let update = ledger.execute_raw("UPDATE audit_entries SET entity_id = 'forged'");
        assert!(update.is_err_and(|err| is_constraint_violation(&err)));
        let delete = ledger.execute_raw("DELETE FROM audit_entries");
        assert!(delete.is_err_and(|err| is_constraint_violation(&err)));

        assert_eq!(ledger.get(&entry.id).expect("get"), Some(entry));
    }

    #[test]
    fn duplicate_id_surfaces_as_append_only() {
        let ledger = ledger();
        ledger
            .execute_raw(
                "INSERT INTO audit_entries VALUES ('2024-06-01T09:00:00.000Z', '2024-06-01T09:00:00.000Z', 'audit_alpha1', 'create', 'web', 'todo', 'x', '{}')",
            )
            .expect("seed row written by another process");

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let err = ledger.append_at(create("a"), now).unwrap_err();
        assert!(matches!(
            err,
            StorageError::AppendOnly { id } if id == "2024-06-01T09:00:00.000Z"
        ));
    }

    #[test]
    fn foreign_version_rows_are_skipped_on_read() {
        let ledger = ledger();
        ledger.append(create("a")).expect("append");
        ledger
            .execute_raw(
                "INSERT INTO audit_entries VALUES ('1999-01-01T00:00:00.000Z', '1999-01-01T00:00:00.000Z', 'audit_beta', 'create', 'web', 'todo', 'x', '{\"version\":\"audit_beta\"}')",
            )
            .expect("insert foreign row");

        assert_eq!(ledger.len().expect("len"), 2);
        assert_eq!(ledger.entries().expect("entries").len(), 1);
    }
}
