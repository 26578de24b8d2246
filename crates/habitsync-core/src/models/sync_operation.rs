//! Outbox operation model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::EntityKind;
use crate::error::FailureClass;

/// Default per-operation retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Failed,
    Completed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }
}

/// A pending mutation awaiting transmission to the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity_kind: EntityKind,
    /// Local id of the entity (re-keyed to the server id once created)
    pub entity_id: String,
    /// Parent habit id for entry operations; orders them behind the habit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Domain fields to send
    pub payload: Value,
    /// Local record version the payload was taken from
    #[serde(default)]
    pub entity_version: u64,
    /// Unix ms, strictly increasing within one queue
    pub timestamp: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

impl SyncOperation {
    /// Build an operation; id, timestamp and status are assigned on enqueue.
    pub fn new(
        op_type: OperationType,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: String::new(),
            op_type,
            entity_kind,
            entity_id: entity_id.into(),
            parent_id: None,
            payload,
            entity_version: 0,
            timestamp: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: OperationStatus::Pending,
            last_error: None,
            failure_class: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    #[must_use]
    pub const fn with_entity_version(mut self, version: u64) -> Self {
        self.entity_version = version;
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether the processor should pick this operation up.
    ///
    /// Terminal failures (validation / not-found) are kept for visibility but
    /// are never retried automatically.
    pub fn is_ready(&self) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => {
                self.retry_count < self.max_retries
                    && self.failure_class.map_or(true, FailureClass::is_retryable)
            }
            OperationStatus::Completed => false,
        }
    }

    /// Failed with a class that automatic retry will not fix.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == OperationStatus::Failed && !self.is_ready()
    }

    /// Id of the entity that orders this operation relative to others.
    pub fn lane_key(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op() -> SyncOperation {
        SyncOperation::new(OperationType::Update, EntityKind::Habit, "h1", json!({}))
    }

    #[test]
    fn serializes_type_in_screaming_case() {
        let value = serde_json::to_value(op()).unwrap();
        assert_eq!(value["type"], json!("UPDATE"));
        assert_eq!(value["status"], json!("PENDING"));
        assert_eq!(value["entityKind"], json!("habit"));
    }

    #[test]
    fn failed_network_op_is_ready_until_budget_exhausted() {
        let mut op = op().with_max_retries(2);
        op.status = OperationStatus::Failed;
        op.failure_class = Some(FailureClass::Network);
        op.retry_count = 1;
        assert!(op.is_ready());
        op.retry_count = 2;
        assert!(!op.is_ready());
        assert!(op.is_terminal_failure());
    }

    #[test]
    fn validation_failure_is_terminal() {
        let mut op = op();
        op.status = OperationStatus::Failed;
        op.failure_class = Some(FailureClass::Validation);
        op.retry_count = 1;
        assert!(!op.is_ready());
    }

    #[test]
    fn entry_ops_share_lane_with_parent_habit() {
        let entry_op =
            SyncOperation::new(OperationType::Create, EntityKind::HabitEntry, "e1", json!({}))
                .with_parent(Some("h1".to_string()));
        assert_eq!(entry_op.lane_key(), "h1");
        assert_eq!(op().lane_key(), "h1");
    }
}
