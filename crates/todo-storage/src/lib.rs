use rusqlite::ErrorCode;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use todo_core::attachment::AttachmentError;
use todo_core::schema::MigrationError;

pub mod audit;
pub mod clock;
pub mod documents;
pub mod todos;
pub mod users;

pub use audit::{AuditLedger, AUDIT_SCHEMA_VERSION};
pub use clock::MonotonicClock;
pub use documents::{Blob, DocumentStore, PutResult, StoreInfo, DOCUMENT_SCHEMA_VERSION};
pub use todos::{AttachmentUpload, TodoRepository};
pub use users::{
    validate_username, StoreNaming, UserRegistry, UserStores, DEFAULT_AUDIT_BASE,
    DEFAULT_ENTITY_BASE, REGISTRY_STORE,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("document conflict: {id}")]
    Conflict { id: String },
    #[error("document not found: {id}")]
    NotFound { id: String },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("invalid username '{0}': use lowercase letters, digits, '_' or '-'")]
    InvalidUsername(String),
    #[error("audit entry {id} already exists; the ledger is append-only")]
    AppendOnly { id: String },
    #[error("{0}")]
    InvalidState(String),
}

impl StorageError {
    /// True when the store itself misbehaved, as opposed to the caller asking
    /// for something invalid. Only these count against store health.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(_)
                | StorageError::Io(_)
                | StorageError::Serialization(_)
                | StorageError::UnsupportedSchemaVersion { .. }
        )
    }

    pub fn is_disk_full(&self) -> bool {
        self.sqlite_code() == Some(ErrorCode::DiskFull)
    }

    /// Lock contention that a later attempt may not hit.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.sqlite_code(),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        )
    }

    fn sqlite_code(&self) -> Option<ErrorCode> {
        match self {
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => Some(code.code),
            _ => None,
        }
    }
}

pub(crate) fn serialization_error(err: serde_json::Error) -> StorageError {
    StorageError::Serialization(err.to_string())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => code.code == ErrorCode::ConstraintViolation,
        _ => false,
    }
}
