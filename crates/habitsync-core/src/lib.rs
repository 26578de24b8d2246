//! habitsync-core - Core library for habitsync
//!
//! Local-first habit tracking: a JSON document store on `SQLite`, an outbox of
//! pending mutations, and a sync engine that drains it against a remote API
//! when the network allows.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use models::{Habit, HabitEntry, HabitEntryRecord, HabitRecord, SyncOperation};
pub use services::{EngineBuilder, HabitSyncEngine};
pub use state::{SyncState, SyncStatus};
