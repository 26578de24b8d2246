//! Error types for habitsync-core

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using habitsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in habitsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Referenced record is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input, never retried
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Version mismatch requiring resolution
    #[error("Conflict on {entity_id}: {reason}")]
    Conflict { entity_id: String, reason: String },

    /// Remote unreachable, retryable
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Unknown collection, undeclared index or illegal transaction access
    #[error("Schema error: {0}")]
    Schema(String),

    /// Store used before `open`
    #[error("Store is not initialized")]
    NotInitialized,

    /// Detected corruption
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// Migration script failed or cannot be rolled back
    #[error("Migration to version {version} failed: {reason}")]
    MigrationFailure { version: u32, reason: String },

    /// Background task ended before producing a result
    #[error("Task aborted: {0}")]
    Aborted(String),

    /// Error of a sync pass that other callers also observed
    #[error("Sync pass failed: {0}")]
    PassFailed(String),

    /// Remote API answered with a non-success status
    #[error("Remote API error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// `SQLite` error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a failure, used to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    /// Remote unreachable or temporarily failing; retry later
    Network,
    /// Request rejected as malformed; needs user correction
    Validation,
    /// Remote does not know the entity
    NotFound,
    /// Remote state diverged from local state
    Conflict,
    /// Local storage failure
    Storage,
}

impl FailureClass {
    /// Whether automatic retry makes sense for this class.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Storage)
    }
}

fn network_message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(timed? ?out|timeout|network|connection (refused|reset|closed|aborted)|could not connect|dns|unreachable|offline|failed to fetch|temporarily unavailable|broken pipe)",
        )
        .expect("valid network message regex")
    })
}

fn not_found_message_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(not found|no such|does not exist|unknown (habit|entry|entity))")
            .expect("valid not-found message regex")
    })
}

/// Classify a free-form error message the way remote failures are reported.
pub fn classify_message(message: &str) -> FailureClass {
    if network_message_pattern().is_match(message) {
        FailureClass::Network
    } else if not_found_message_pattern().is_match(message) {
        FailureClass::NotFound
    } else {
        FailureClass::Validation
    }
}

impl Error {
    /// Classify this error into network-class (retryable) vs terminal classes.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::NetworkFailure(_) => FailureClass::Network,
            Self::Http(error) => {
                if error.is_timeout() || error.is_connect() || error.is_request() {
                    FailureClass::Network
                } else {
                    classify_message(&error.to_string())
                }
            }
            Self::Remote { status, message } => match status {
                404 | 410 => FailureClass::NotFound,
                409 => FailureClass::Conflict,
                408 | 429 => FailureClass::Network,
                500..=599 => FailureClass::Network,
                _ => classify_message(message),
            },
            Self::NotFound(_) => FailureClass::NotFound,
            Self::Conflict { .. } => FailureClass::Conflict,
            Self::ValidationFailed(_) | Self::Serialization(_) => FailureClass::Validation,
            Self::Database(_)
            | Self::Io(_)
            | Self::Schema(_)
            | Self::NotInitialized
            | Self::Aborted(_)
            | Self::PassFailed(_)
            | Self::IntegrityViolation(_)
            | Self::MigrationFailure { .. } => FailureClass::Storage,
        }
    }

    /// Take back an error shared between joined callers of one sync pass.
    pub fn from_shared(error: std::sync::Arc<Self>) -> Self {
        std::sync::Arc::try_unwrap(error).unwrap_or_else(|shared| {
            if shared.is_network() {
                Self::NetworkFailure(shared.to_string())
            } else {
                Self::PassFailed(shared.to_string())
            }
        })
    }

    /// Shorthand for `failure_class() == Network`.
    pub fn is_network(&self) -> bool {
        self.failure_class() == FailureClass::Network
    }
}
