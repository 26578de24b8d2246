use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] habitsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Habit name cannot be empty")]
    EmptyName,
    #[error("No habit matches '{0}'")]
    HabitNotFound(String),
    #[error("{0}")]
    AmbiguousHabit(String),
    #[error("No entry for habit '{habit}' on {date}")]
    EntryNotFound { habit: String, date: String },
    #[error("Invalid date '{0}': use YYYY-MM-DD, 'today' or 'yesterday'")]
    InvalidDate(String),
    #[error("Nothing to update: pass at least one field")]
    NothingToUpdate,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Conflict id is required unless --all is given")]
    MissingConflictId,
    #[error(
        "Sync is not configured. Set api_url in the config file or HABITSYNC_API_URL in the environment."
    )]
    SyncNotConfigured,
    #[error("Store is corrupted: {0}")]
    Corrupted(String),
}
