//! Sync-tracked record envelope shared by every domain entity

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::util::new_temp_id;

/// Kind of domain entity carried by a record or sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Habit,
    HabitEntry,
}

impl EntityKind {
    /// Name of the store collection holding this kind.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Habit => crate::db::schema::HABITS,
            Self::HabitEntry => crate::db::schema::HABIT_ENTRIES,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Habit => "habit",
            Self::HabitEntry => "habitEntry",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "habit" => Ok(Self::Habit),
            "habitEntry" | "habit_entry" | "entry" => Ok(Self::HabitEntry),
            other => Err(Error::ValidationFailed(format!("unknown entity kind: {other}"))),
        }
    }
}

/// Sync metadata carried by every persisted record.
///
/// Invariant: `synced == true` implies `server_id.is_some()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Local primary key; equals `temp_id` until the server assigns one
    pub id: String,
    /// Client placeholder id, present only before the first successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    /// Id assigned by the remote once synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Bumped on every local mutation
    pub version: u64,
    /// Unix ms of the most recent local mutation
    pub last_modified: i64,
    /// True only once the remote acknowledged this exact version
    pub synced: bool,
    /// Soft-delete flag
    pub deleted: bool,
    /// Last version the server reported for this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
}

impl SyncMeta {
    /// Metadata for a record created locally and not yet synced.
    pub fn new_local(now: i64) -> Self {
        let temp_id = new_temp_id();
        Self {
            id: temp_id.clone(),
            temp_id: Some(temp_id),
            server_id: None,
            version: 1,
            last_modified: now,
            synced: false,
            deleted: false,
            server_version: None,
        }
    }

    /// Register a local mutation.
    pub fn touch(&mut self, now: i64) {
        self.version += 1;
        self.last_modified = now.max(self.last_modified);
        self.synced = false;
    }

    /// Id to use when addressing the remote; falls back to the local id when
    /// the entity was never synced.
    pub fn remote_id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.id)
    }
}

/// A domain value wrapped with its sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    #[serde(flatten)]
    pub meta: SyncMeta,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Record<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Wrap `data` as a brand-new local record.
    pub fn new_local(data: T, now: i64) -> Self {
        Self {
            meta: SyncMeta::new_local(now),
            data,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Serialize into the JSON document stored in the local store.
    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a stored JSON document.
    pub fn from_document(document: Value) -> Result<Self> {
        Ok(serde_json::from_value(document)?)
    }

    /// Domain fields only, as sent to the remote.
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.data)?)
    }
}

/// Fields of a stored document that belong to [`SyncMeta`] rather than the domain.
pub const META_FIELDS: [&str; 8] = [
    "id",
    "tempId",
    "serverId",
    "version",
    "lastModified",
    "synced",
    "deleted",
    "serverVersion",
];

/// Strip sync metadata from a stored document, leaving domain fields.
pub fn domain_fields(document: &Value) -> Value {
    match document {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !META_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
