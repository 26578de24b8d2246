use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDate};
use habitsync_core::models::ConflictRecord;
use habitsync_core::{EngineConfig, HabitEntryRecord, HabitRecord, HabitSyncEngine};
use serde::Serialize;

use crate::error::CliError;

/// Global options every command needs to open the engine.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub db_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub json: bool,
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("habitsync").join("habitsync.db"))
        .ok_or_else(|| CliError::Config("failed to resolve data directory".to_string()))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("habitsync").join("config.json"))
}

/// Config file, then `HABITSYNC_*` environment, then command-line flags.
pub fn load_config(options: &GlobalOptions) -> Result<EngineConfig, CliError> {
    let mut config = match options.config_path.clone().or_else(default_config_path) {
        Some(path) => EngineConfig::load_from_path(&path)?,
        None => EngineConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(path) = &options.db_path {
        config.db_path = Some(path.clone());
    }
    if config.db_path.is_none() {
        config.db_path = Some(default_db_path()?);
    }
    Ok(config)
}

pub async fn open_engine(options: &GlobalOptions) -> Result<HabitSyncEngine, CliError> {
    let config = load_config(options)?;
    Ok(HabitSyncEngine::builder(config).open().await?)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Find a habit by exact id, case-insensitive name, or a unique id prefix or suffix.
pub async fn resolve_habit(
    engine: &HabitSyncEngine,
    query: &str,
) -> Result<HabitRecord, CliError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CliError::HabitNotFound(String::new()));
    }
    let habits = engine.list_habits(true).await?;
    if let Some(habit) = habits.iter().find(|habit| habit.id() == query) {
        return Ok(habit.clone());
    }

    let wanted = query.to_lowercase();
    if let Some(habit) = habits
        .iter()
        .find(|habit| habit.data.name.to_lowercase() == wanted)
    {
        return Ok(habit.clone());
    }

    let matching = habits
        .iter()
        .filter(|habit| habit.id().starts_with(query) || habit.id().ends_with(query))
        .collect::<Vec<_>>();
    match matching.as_slice() {
        [] => Err(CliError::HabitNotFound(query.to_string())),
        [habit] => Ok((*habit).clone()),
        many => {
            let options = many
                .iter()
                .take(3)
                .map(|habit| short_id(habit.id()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousHabit(format!(
                "Habit id '{query}' is ambiguous. Matches: {options}"
            )))
        }
    }
}

/// Parse `YYYY-MM-DD`, `today` or `yesterday` relative to `today`.
pub fn parse_day(value: &str, today: NaiveDate) -> Result<NaiveDate, CliError> {
    match value.trim().to_lowercase().as_str() {
        "today" => Ok(today),
        "yesterday" => Ok(today - Duration::days(1)),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
            .map_err(|_| CliError::InvalidDate(value.to_string())),
    }
}

pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn normalize_name(parts: &[String]) -> Result<String, CliError> {
    let name = parts.join(" ");
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyName);
    }
    Ok(trimmed.to_string())
}

/// Display form of an id: short ids as-is, otherwise the random tail.
pub fn short_id(id: &str) -> String {
    const SHORT_LEN: usize = 12;
    let count = id.chars().count();
    if count <= SHORT_LEN + 1 {
        return id.to_string();
    }
    id.chars().skip(count - SHORT_LEN).collect()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff_seconds = (now_ms - timestamp_ms).max(0) / 1000;
    if diff_seconds < 60 {
        return "just now".to_string();
    }

    let minutes = diff_seconds / 60;
    if minutes < 60 {
        return format!("{minutes}m ago");
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h ago");
    }

    let days = hours / 24;
    format!("{days}d ago")
}

pub fn format_habit_line(habit: &HabitRecord) -> String {
    let mut flags = Vec::new();
    if habit.data.archived {
        flags.push("archived");
    }
    if !habit.meta.synced {
        flags.push("unsynced");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    format!("{}  {}{flags}", short_id(habit.id()), habit.data.name)
}

pub fn format_entry_line(entry: &HabitEntryRecord, habit_name: Option<&str>) -> String {
    let mark = if entry.data.completed { "x" } else { " " };
    let habit = habit_name.map_or_else(|| short_id(&entry.data.habit_id), ToString::to_string);
    let note = entry
        .data
        .note
        .as_deref()
        .map(|note| format!("  ({note})"))
        .unwrap_or_default();
    let sync = if entry.meta.synced { "" } else { " *" };
    format!("[{mark}] {}  {habit}{note}{sync}", entry.data.date)
}

pub fn format_conflict_line(conflict: &ConflictRecord, now_ms: i64) -> String {
    format!(
        "{}  {} {}  server v{}  detected {}",
        short_id(&conflict.id),
        conflict.entity_kind,
        short_id(&conflict.entity_id),
        conflict.server_data.version,
        format_relative_time(conflict.timestamp, now_ms)
    )
}

pub fn now_ms() -> i64 {
    habitsync_core::util::unix_millis_now()
}

pub fn ensure_path_exists(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        Ok(())
    } else {
        Err(CliError::Config(format!("{} does not exist", path.display())))
    }
}
