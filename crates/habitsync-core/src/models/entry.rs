//! Habit entry model: one completion record per habit per day

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::{EntityKind, Record};
use super::SyncEntity;
use crate::error::{Error, Result};
use crate::util::normalize_text_option;

/// Maximum length of an entry note, in characters
pub const MAX_NOTE_LEN: usize = 1000;

/// Completion state of a habit on a given day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitEntry {
    /// Local id of the parent habit
    pub habit_id: String,
    /// Calendar day, serialized as `YYYY-MM-DD`
    pub date: NaiveDate,
    #[serde(default = "default_completed")]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

const fn default_completed() -> bool {
    true
}

/// A synced habit entry record
pub type HabitEntryRecord = Record<HabitEntry>;

impl HabitEntry {
    /// A completed entry for `habit_id` on `date`
    #[must_use]
    pub fn completed(habit_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            habit_id: habit_id.into(),
            date,
            completed: true,
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Parse a `YYYY-MM-DD` day.
    pub fn parse_date(value: &str) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
            .map_err(|error| Error::ValidationFailed(format!("invalid date {value:?}: {error}")))
    }

    /// Compound domain key value, matching the `habitId_date` index.
    pub fn index_key(habit_id: &str, date: NaiveDate) -> [serde_json::Value; 2] {
        [
            serde_json::Value::String(habit_id.to_string()),
            serde_json::Value::String(date.format("%Y-%m-%d").to_string()),
        ]
    }
}

impl SyncEntity for HabitEntry {
    const KIND: EntityKind = EntityKind::HabitEntry;

    fn validate(&mut self) -> Result<()> {
        self.habit_id = self.habit_id.trim().to_string();
        self.note = normalize_text_option(self.note.take());
        if self.habit_id.is_empty() {
            return Err(Error::ValidationFailed("entry must reference a habit".into()));
        }
        if let Some(note) = &self.note {
            if note.chars().count() > MAX_NOTE_LEN {
                return Err(Error::ValidationFailed(format!(
                    "entry note must be at most {MAX_NOTE_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    fn domain_key(&self) -> String {
        format!("{}|{}", self.habit_id, self.date)
    }

    fn parent_id(&self) -> Option<&str> {
        Some(&self.habit_id)
    }
}

/// Partial update applied to an existing entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryUpdate {
    #[serde(default)]
    pub completed: Option<bool>,
    /// `Some("")` clears the note
    #[serde(default)]
    pub note: Option<String>,
}

impl EntryUpdate {
    pub const fn is_empty(&self) -> bool {
        self.completed.is_none() && self.note.is_none()
    }

    pub fn apply(&self, entry: &mut HabitEntry) {
        if let Some(completed) = self.completed {
            entry.completed = completed;
        }
        if let Some(note) = &self.note {
            entry.note = normalize_text_option(Some(note.clone()));
        }
    }
}
