use std::collections::HashMap;

use crate::commands::common::{
    format_entry_line, local_today, open_engine, parse_day, print_json, resolve_habit,
    GlobalOptions,
};
use crate::error::CliError;

pub async fn run_toggle(
    habit: &str,
    date: &str,
    note: Option<String>,
    options: &GlobalOptions,
) -> Result<(), CliError> {
    let day = parse_day(date, local_today())?;
    let engine = open_engine(options).await?;
    let habit = resolve_habit(&engine, habit).await?;

    let entry = match note {
        // A note always marks the day completed.
        Some(note) => {
            engine
                .set_completion(habit.id(), day, true, Some(note))
                .await?
        }
        None => engine.toggle_entry(habit.id(), day).await?,
    };

    if options.json {
        print_json(&entry)?;
    } else {
        println!("{}", format_entry_line(&entry, Some(&habit.data.name)));
    }
    Ok(())
}

pub async fn run_list(habit: Option<&str>, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let filter = match habit {
        Some(query) => Some(resolve_habit(&engine, query).await?),
        None => None,
    };
    let entries = engine
        .list_entries(filter.as_ref().map(|habit| habit.id()))
        .await?;

    if options.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No entries recorded.");
        return Ok(());
    }
    let names = engine
        .list_habits(true)
        .await?
        .into_iter()
        .map(|habit| (habit.meta.id, habit.data.name))
        .collect::<HashMap<_, _>>();
    for entry in &entries {
        let name = names.get(&entry.data.habit_id).map(String::as_str);
        println!("{}", format_entry_line(entry, name));
    }
    Ok(())
}

pub async fn run_delete(habit: &str, date: &str, options: &GlobalOptions) -> Result<(), CliError> {
    let day = parse_day(date, local_today())?;
    let engine = open_engine(options).await?;
    let habit = resolve_habit(&engine, habit).await?;
    let entry = engine
        .list_entries(Some(habit.id()))
        .await?
        .into_iter()
        .find(|entry| entry.data.date == day)
        .ok_or_else(|| CliError::EntryNotFound {
            habit: habit.data.name.clone(),
            date: day.to_string(),
        })?;

    engine.delete_entry(entry.id()).await?;
    println!("{}", entry.id());
    Ok(())
}
