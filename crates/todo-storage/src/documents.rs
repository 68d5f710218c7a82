//! Named JSON document store on sqlite.
//!
//! Revisions follow the `{generation}-{digest}` convention of replicating
//! document stores: every successful write bumps the generation, and a write
//! must present the revision it read or it is rejected as a conflict.

use crate::{lock, serialization_error, StorageError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use todo_core::attachment::hash_bytes;
use tracing::debug;

pub const DOCUMENT_SCHEMA_VERSION: i64 = 2;

const REV_DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResult {
    pub id: String,
    pub rev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub db_name: String,
    pub doc_count: u64,
    pub update_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

pub struct DocumentStore {
    name: String,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Self::from_connection(conn, name.into(), Some(path))
    }

    pub fn open_in_memory(name: impl Into<String>) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, name.into(), None)
    }

    fn from_connection(
        conn: Connection,
        name: String,
        path: Option<PathBuf>,
    ) -> Result<Self, StorageError> {
        let store = Self {
            name,
            path,
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
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
        let mut current = self.schema_version()?;
        if current > DOCUMENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: DOCUMENT_SCHEMA_VERSION,
            });
        }

        let conn = self.conn();
        if current < 1 {
            let sql = include_str!("../migrations/0001_documents.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_blobs.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Returns the stored document with `_id` and `_rev` filled in.
    pub fn get(&self, id: &str) -> Result<Option<Value>, StorageError> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT rev, body_json FROM documents WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(rev, body_json)| hydrate(id, &rev, &body_json))
            .transpose()
    }

    /// Writes a document. A new document must not carry `_rev`; an existing
    /// one must carry the revision currently stored.
    pub fn put(&self, doc: &Value) -> Result<PutResult, StorageError> {
        let object = doc.as_object().ok_or_else(|| {
            StorageError::InvalidDocument("document is not a JSON object".to_string())
        })?;
        let id = object
            .get("_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StorageError::InvalidDocument("document has no _id".to_string()))?
            .to_string();
        let presented_rev = object.get("_rev").and_then(Value::as_str);

        let mut body = object.clone();
        body.remove("_id");
        body.remove("_rev");
        let body_json = serde_json::to_string(&Value::Object(body)).map_err(serialization_error)?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stored_rev = current_rev(&tx, &id)?;
        if stored_rev.as_deref() != presented_rev {
            return Err(StorageError::Conflict { id });
        }

        let rev = next_revision(stored_rev.as_deref(), &body_json);
        let seq = bump_update_seq(&tx)?;
        tx.execute(
            "
            INSERT INTO documents (id, rev, seq, body_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                rev=excluded.rev,
                seq=excluded.seq,
                body_json=excluded.body_json,
                updated_at=excluded.updated_at
            ",
            params![id, rev, seq, body_json, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        debug!(event = "document_put", store = %self.name, id = %id, rev = %rev);
        Ok(PutResult { id, rev })
    }

    pub fn remove(&self, id: &str, rev: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        match current_rev(&tx, id)? {
            None => {
                return Err(StorageError::NotFound { id: id.to_string() });
            }
            Some(stored) if stored != rev => {
                return Err(StorageError::Conflict { id: id.to_string() });
            }
            Some(_) => {}
        }
        bump_update_seq(&tx)?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        tx.commit()?;

        debug!(event = "document_removed", store = %self.name, id = %id);
        Ok(())
    }

    /// Every document, ordered by id.
    pub fn all_docs(&self) -> Result<Vec<Value>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, rev, body_json FROM documents ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, rev, body_json) = row?;
            docs.push(hydrate(&id, &rev, &body_json)?);
        }
        Ok(docs)
    }

    pub fn info(&self) -> Result<StoreInfo, StorageError> {
        let conn = self.conn();
        let doc_count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let update_seq: i64 = conn.query_row(
            "SELECT value FROM store_meta WHERE key = 'update_seq'",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreInfo {
            db_name: self.name.clone(),
            doc_count: doc_count.max(0) as u64,
            update_seq: update_seq.max(0) as u64,
        })
    }

    /// Bytes occupied by the database pages.
    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        let conn = self.conn();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((page_count.max(0) as u64).saturating_mul(page_size.max(0) as u64))
    }

    /// Stores a binary payload once. Returns false when the id already held
    /// a blob, which for content-addressed ids means identical bytes.
    pub fn put_blob(&self, id: &str, content_type: &str, data: &[u8]) -> Result<bool, StorageError> {
        let changes = self.conn().execute(
            "
            INSERT OR IGNORE INTO blobs (id, content_type, size, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![id, content_type, data.len() as i64, data, Utc::now().to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn get_blob(&self, id: &str) -> Result<Option<Blob>, StorageError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT content_type, data FROM blobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Blob {
                        id: id.to_string(),
                        content_type: row.get(0)?,
                        data: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, StorageError> {
        Ok(self.conn().execute(sql, [])?)
    }
}

fn current_rev(tx: &Transaction<'_>, id: &str) -> Result<Option<String>, StorageError> {
    Ok(tx
        .query_row(
            "SELECT rev FROM documents WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

fn bump_update_seq(tx: &Transaction<'_>) -> Result<i64, StorageError> {
    tx.execute(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'update_seq'",
        [],
    )?;
    Ok(tx.query_row(
        "SELECT value FROM store_meta WHERE key = 'update_seq'",
        [],
        |row| row.get(0),
    )?)
}

fn next_revision(previous: Option<&str>, body_json: &str) -> String {
    let generation = previous
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let digest = hash_bytes(body_json.as_bytes());
    format!("{generation}-{}", &digest[..REV_DIGEST_LEN])
}

fn hydrate(id: &str, rev: &str, body_json: &str) -> Result<Value, StorageError> {
    let body: Map<String, Value> = serde_json::from_str(body_json).map_err(serialization_error)?;
    let mut doc = Map::with_capacity(body.len() + 2);
    doc.insert("_id".to_string(), Value::String(id.to_string()));
    doc.insert("_rev".to_string(), Value::String(rev.to_string()));
    doc.extend(body);
    Ok(Value::Object(doc))
}
