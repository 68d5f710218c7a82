use super::{
    adopt, decode, version_tag, MigrationContext, MigrationError, VersionedKind, VERSION_FIELD,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const USER_KIND: &str = "user_registry";
pub const USER_ALPHA1: &str = "alpha1";
pub const USER_ALPHA2: &str = "alpha2";

pub type UserRegistryEntry = UserAlpha2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyUser {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAlpha1 {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub username: String,
    pub created_at: String,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAlpha2 {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub version: String,
    pub username: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl UserAlpha2 {
    pub fn new(username: impl Into<String>, created_at: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: registry_id(&username),
            rev: None,
            version: USER_ALPHA2.to_string(),
            username,
            created_at: created_at.into(),
            display_name: None,
            last_login: None,
            extra: BTreeMap::new(),
        }
    }
}

pub fn registry_id(username: &str) -> String {
    format!("user_{username}")
}

pub fn lift_legacy(
    legacy: LegacyUser,
    ctx: &MigrationContext,
) -> Result<UserAlpha1, MigrationError> {
    let LegacyUser {
        id,
        rev,
        username,
        created_at,
        mut extra,
    } = legacy;
    extra.remove(VERSION_FIELD);
    if username.trim().is_empty() {
        return Err(MigrationError::shape(USER_KIND, "username is empty"));
    }
    Ok(UserAlpha1 {
        id: id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| registry_id(&username)),
        rev,
        version: USER_ALPHA1.to_string(),
        username,
        created_at: created_at.unwrap_or_else(|| ctx.now_iso()),
        extra,
    })
}

pub fn migrate_alpha1_to_alpha2(doc: UserAlpha1) -> UserAlpha2 {
    let UserAlpha1 {
        id,
        rev,
        version: _,
        username,
        created_at,
        mut extra,
    } = doc;
    let display_name = adopt(&mut extra, "displayName");
    let last_login = adopt(&mut extra, "lastLogin");
    UserAlpha2 {
        id,
        rev,
        version: USER_ALPHA2.to_string(),
        username,
        created_at,
        display_name,
        last_login,
        extra,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserRegistryDocument {
    Legacy(LegacyUser),
    Alpha1(UserAlpha1),
    Alpha2(UserAlpha2),
    Unknown { version: String },
}

impl VersionedKind for UserRegistryDocument {
    const KIND: &'static str = USER_KIND;
    const VERSIONS: &'static [&'static str] = &[USER_ALPHA1, USER_ALPHA2];

    type Latest = UserRegistryEntry;

    fn parse(raw: &Value) -> Result<Self, MigrationError> {
        Ok(match version_tag(USER_KIND, raw)? {
            None => Self::Legacy(decode(USER_KIND, raw)?),
            Some(USER_ALPHA2) => Self::Alpha2(decode(USER_KIND, raw)?),
            Some(USER_ALPHA1) => Self::Alpha1(decode(USER_KIND, raw)?),
            Some(other) => Self::Unknown {
                version: other.to_string(),
            },
        })
    }

    fn version(&self) -> Option<&str> {
        match self {
            Self::Legacy(_) => None,
            Self::Alpha1(_) => Some(USER_ALPHA1),
            Self::Alpha2(_) => Some(USER_ALPHA2),
            Self::Unknown { version } => Some(version.as_str()),
        }
    }

    fn upgrade(self, ctx: &MigrationContext) -> Result<Self, MigrationError> {
        match self {
            Self::Legacy(doc) => lift_legacy(doc, ctx).map(Self::Alpha1),
            Self::Alpha1(doc) => Ok(Self::Alpha2(migrate_alpha1_to_alpha2(doc))),
            Self::Alpha2(doc) => Ok(Self::Alpha2(doc)),
            Self::Unknown { version } => Err(MigrationError::UnsupportedVersion {
                kind: USER_KIND,
                found: version,
                latest: USER_ALPHA2,
            }),
        }
    }

    fn into_latest(self) -> Result<UserRegistryEntry, Self> {
        match self {
            Self::Alpha2(doc) => Ok(doc),
            other => Err(other),
        }
    }
}
