//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::EntityKind;

/// Authoritative representation of an entity as returned by the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub server_id: String,
    pub version: u64,
    /// Unix ms of the server-side modification
    pub last_modified: i64,
    /// Domain fields
    pub data: Value,
}

/// Divergence between a pending local edit and the server's version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Full local document at detection time
    pub local_data: Value,
    pub server_data: RemoteRecord,
    /// Detection time (unix ms)
    pub timestamp: i64,
    pub resolved: bool,
}

/// How a single conflict is resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "strategy", content = "data")]
pub enum Resolution {
    /// Keep the local payload and push it again
    UseLocal,
    /// Adopt the server payload
    UseServer,
    /// Let the configured merger combine both sides
    Merge,
    /// Caller-supplied, already merged domain fields
    Merged(Value),
}

impl Resolution {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UseLocal => "USE_LOCAL",
            Self::UseServer => "USE_SERVER",
            Self::Merge => "MERGE",
            Self::Merged(_) => "MERGED",
        }
    }
}

/// Policy used when conflicts are resolved without a user in the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoResolvePolicy {
    #[default]
    ServerWins,
    LocalWins,
    /// Newest `lastModified` wins; ties go to the server
    LastWriteWins,
    /// Leave conflicts for the user
    Manual,
}
