use habitsync_core::models::HabitUpdate;
use habitsync_core::{Habit, HabitEntryRecord};
use serde::Serialize;

use crate::commands::common::{
    format_entry_line, format_habit_line, normalize_name, open_engine, print_json, resolve_habit,
    GlobalOptions,
};
use crate::error::CliError;

const RECENT_ENTRIES: usize = 14;

pub async fn run_add(
    name: &[String],
    description: Option<String>,
    color: Option<String>,
    options: &GlobalOptions,
) -> Result<(), CliError> {
    let mut habit = Habit::new(normalize_name(name)?);
    habit.description = description;
    habit.color = color;

    let engine = open_engine(options).await?;
    let record = engine.create_habit(habit).await?;
    if options.json {
        print_json(&record)?;
    } else {
        println!("{}", record.id());
    }
    Ok(())
}

pub async fn run_list(include_archived: bool, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let habits = engine.list_habits(include_archived).await?;

    if options.json {
        return print_json(&habits);
    }
    if habits.is_empty() {
        println!("No habits yet. Add one with `habitsync habit add <name>`.");
        return Ok(());
    }
    for habit in &habits {
        println!("{}", format_habit_line(habit));
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HabitDetails<'a> {
    #[serde(flatten)]
    habit: &'a habitsync_core::HabitRecord,
    recent_entries: &'a [HabitEntryRecord],
}

pub async fn run_show(query: &str, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let habit = resolve_habit(&engine, query).await?;
    let mut entries = engine.list_entries(Some(habit.id())).await?;
    entries.reverse();
    entries.truncate(RECENT_ENTRIES);

    if options.json {
        return print_json(&HabitDetails {
            habit: &habit,
            recent_entries: &entries,
        });
    }

    println!("{}", format_habit_line(&habit));
    println!("  id:       {}", habit.id());
    if let Some(description) = &habit.data.description {
        println!("  about:    {description}");
    }
    if let Some(color) = &habit.data.color {
        println!("  color:    {color}");
    }
    println!("  version:  {}", habit.meta.version);
    if let Some(server_id) = &habit.meta.server_id {
        println!("  server:   {server_id}");
    }
    for entry in &entries {
        println!("  {}", format_entry_line(entry, None));
    }
    Ok(())
}

pub async fn run_update(
    query: &str,
    update: HabitUpdate,
    options: &GlobalOptions,
) -> Result<(), CliError> {
    if update.is_empty() {
        return Err(CliError::NothingToUpdate);
    }
    let engine = open_engine(options).await?;
    let habit = resolve_habit(&engine, query).await?;
    let updated = engine.update_habit(habit.id(), update).await?;
    if options.json {
        print_json(&updated)?;
    } else {
        println!("{}", format_habit_line(&updated));
    }
    Ok(())
}

pub async fn run_delete(query: &str, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let habit = resolve_habit(&engine, query).await?;
    engine.delete_habit(habit.id()).await?;
    println!("{}", habit.id());
    Ok(())
}
