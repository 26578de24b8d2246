//! Habit model

use serde::{Deserialize, Serialize};

use super::record::{EntityKind, Record};
use super::SyncEntity;
use crate::error::{Error, Result};
use crate::util::normalize_text_option;

/// Maximum length of a habit name, in characters
pub const MAX_NAME_LEN: usize = 100;
/// Maximum length of a habit description, in characters
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// A habit the user tracks daily
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Habit {
    /// Display name, unique per user (case-insensitive)
    pub name: String,
    /// Optional free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional `#RRGGBB` accent color
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Archived habits stay visible in history but accept no new entries
    #[serde(default)]
    pub archived: bool,
}

/// A synced habit record
pub type HabitRecord = Record<Habit>;

impl Habit {
    /// Create a habit with the given name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            color: None,
            archived: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.description = normalize_text_option(self.description.take());
        self.color = normalize_text_option(self.color.take());
    }
}

impl SyncEntity for Habit {
    const KIND: EntityKind = EntityKind::Habit;

    fn validate(&mut self) -> Result<()> {
        self.normalize();
        if self.name.is_empty() {
            return Err(Error::ValidationFailed("habit name cannot be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(Error::ValidationFailed(format!(
                "habit name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if let Some(description) = &self.description {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(Error::ValidationFailed(format!(
                    "habit description must be at most {MAX_DESCRIPTION_LEN} characters"
                )));
            }
        }
        if let Some(color) = &self.color {
            if !is_hex_color(color) {
                return Err(Error::ValidationFailed(format!(
                    "habit color must look like #RRGGBB, got {color}"
                )));
            }
        }
        Ok(())
    }

    fn domain_key(&self) -> String {
        self.name.trim().to_lowercase()
    }

    fn parent_id(&self) -> Option<&str> {
        None
    }
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Partial update applied to an existing habit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// `Some("")` clears the description
    #[serde(default)]
    pub description: Option<String>,
    /// `Some("")` clears the color
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
}

impl HabitUpdate {
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.color.is_none()
            && self.archived.is_none()
    }

    /// Apply this update on top of `habit`.
    pub fn apply(&self, habit: &mut Habit) {
        if let Some(name) = &self.name {
            habit.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            habit.description = normalize_text_option(Some(description.clone()));
        }
        if let Some(color) = &self.color {
            habit.color = normalize_text_option(Some(color.clone()));
        }
        if let Some(archived) = self.archived {
            habit.archived = archived;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_trims_and_accepts_reasonable_habit() {
        let mut habit = Habit::new("  Exercise ").with_color("#A1B2C3");
        habit.validate().unwrap();
        assert_eq!(habit.name, "Exercise");
    }

    #[test]
    fn validate_rejects_empty_and_long_names() {
        assert!(Habit::new("   ").validate().is_err());
        assert!(Habit::new("x".repeat(MAX_NAME_LEN + 1)).validate().is_err());
        assert!(Habit::new("x".repeat(MAX_NAME_LEN)).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_color() {
        let mut habit = Habit::new("Read").with_color("red");
        assert!(matches!(habit.validate(), Err(Error::ValidationFailed(_))));
    }

    #[test]
    fn domain_key_is_case_insensitive() {
        assert_eq!(Habit::new("Read ").domain_key(), Habit::new("read").domain_key());
    }

    #[test]
    fn update_clears_optional_fields_with_empty_string() {
        let mut habit = Habit::new("Read").with_description("books");
        HabitUpdate {
            description: Some(String::new()),
            archived: Some(true),
            ..HabitUpdate::default()
        }
        .apply(&mut habit);
        assert_eq!(habit.description, None);
        assert!(habit.archived);
    }
}
