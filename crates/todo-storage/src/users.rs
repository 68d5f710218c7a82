use crate::audit::AuditLedger;
use crate::documents::DocumentStore;
use crate::StorageError;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use todo_core::schema::user::registry_id;
use todo_core::schema::{iso_timestamp, migrate_to_latest, UserRegistryDocument, UserRegistryEntry};
use tracing::info;

pub const DEFAULT_ENTITY_BASE: &str = "todos";
pub const DEFAULT_AUDIT_BASE: &str = "todos_audit";
pub const REGISTRY_STORE: &str = "users";

const DATABASE_EXTENSION: &str = "sqlite3";

/// Usernames become part of database names, so only `[a-z0-9_-]` is allowed.
pub fn validate_username(username: &str) -> Result<(), StorageError> {
    let valid = !username.is_empty()
        && username
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidUsername(username.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNaming {
    pub entity_base: String,
    pub audit_base: String,
}

impl Default for StoreNaming {
    fn default() -> Self {
        Self {
            entity_base: DEFAULT_ENTITY_BASE.to_string(),
            audit_base: DEFAULT_AUDIT_BASE.to_string(),
        }
    }
}

impl StoreNaming {
    pub fn entity_store(&self, username: &str) -> Result<String, StorageError> {
        validate_username(username)?;
        Ok(format!("{}_{username}", self.entity_base))
    }

    pub fn audit_store(&self, username: &str) -> Result<String, StorageError> {
        validate_username(username)?;
        Ok(format!("{}_{username}", self.audit_base))
    }
}

pub fn database_path(dir: &Path, store_name: &str) -> PathBuf {
    dir.join(format!("{store_name}.{DATABASE_EXTENSION}"))
}

/// The entity store and audit ledger that belong to one user.
pub struct UserStores {
    username: String,
    entities: DocumentStore,
    audit: AuditLedger,
}

impl UserStores {
    pub fn open(dir: &Path, username: &str, naming: &StoreNaming) -> Result<Self, StorageError> {
        let entity_name = naming.entity_store(username)?;
        let audit_name = naming.audit_store(username)?;
        fs::create_dir_all(dir)?;
        let entities = DocumentStore::open(database_path(dir, &entity_name), entity_name)?;
        let audit = AuditLedger::open(database_path(dir, &audit_name), audit_name)?;
        info!(
            event = "user_stores_opened",
            username = %username,
            entities = %entities.name(),
            audit = %audit.name()
        );
        Ok(Self {
            username: username.to_string(),
            entities,
            audit,
        })
    }

    pub fn open_in_memory(username: &str, naming: &StoreNaming) -> Result<Self, StorageError> {
        let entities = DocumentStore::open_in_memory(naming.entity_store(username)?)?;
        let audit = AuditLedger::open_in_memory(naming.audit_store(username)?)?;
        Ok(Self {
            username: username.to_string(),
            entities,
            audit,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn entities(&self) -> &DocumentStore {
        &self.entities
    }

    pub fn audit(&self) -> &AuditLedger {
        &self.audit
    }
}

/// Shared registry of known users, one `user_{username}` document each.
pub struct UserRegistry {
    store: DocumentStore,
}

impl UserRegistry {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let store = DocumentStore::open(database_path(dir, REGISTRY_STORE), REGISTRY_STORE)?;
        Ok(Self { store })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            store: DocumentStore::open_in_memory(REGISTRY_STORE)?,
        })
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn get(&self, username: &str) -> Result<Option<UserRegistryEntry>, StorageError> {
        validate_username(username)?;
        self.store
            .get(&registry_id(username))?
            .map(|raw| migrate_to_latest::<UserRegistryDocument>(&raw).map_err(StorageError::from))
            .transpose()
    }

    /// Returns the existing entry or writes a fresh one.
    pub fn register(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<UserRegistryEntry, StorageError> {
        if let Some(existing) = self.get(username)? {
            return Ok(existing);
        }
        let mut entry = UserRegistryEntry::new(username, iso_timestamp(now));
        let value = serde_json::to_value(&entry).map_err(crate::serialization_error)?;
        entry.rev = Some(self.store.put(&value)?.rev);
        info!(event = "user_registered", username = %username);
        Ok(entry)
    }

    /// Stamps `lastLogin`, writing the entry back in the current schema.
    pub fn record_login(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<UserRegistryEntry, StorageError> {
        let mut entry = self
            .get(username)?
            .ok_or_else(|| StorageError::NotFound {
                id: registry_id(username),
            })?;
        entry.last_login = Some(iso_timestamp(now));
        let value = serde_json::to_value(&entry).map_err(crate::serialization_error)?;
        entry.rev = Some(self.store.put(&value)?.rev);
        Ok(entry)
    }
}
