//! habitsync CLI - track habits from the terminal
//!
//! Every command works offline; `habitsync sync` pushes queued changes.

mod cli;
mod commands;
mod error;
#[cfg(test)]
mod tests;

use clap::Parser;
use habitsync_core::models::HabitUpdate;
use tracing_subscriber::EnvFilter;

use crate::cli::{
    BackupCommands, Cli, Commands, ConflictCommands, EntryCommands, HabitCommands,
    IntegrityCommands,
};
use crate::commands::common::GlobalOptions;
use crate::commands::{
    backup, completions, conflicts, entry, habit, integrity, migrate, status, sync,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("habitsync=info,habitsync_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = GlobalOptions {
        db_path: cli.db_path,
        config_path: cli.config,
        json: cli.json,
    };

    match cli.command {
        Commands::Habit { command } => run_habit(command, &options).await?,
        Commands::Entry { command } => match command {
            EntryCommands::Toggle { habit, date, note } => {
                entry::run_toggle(&habit, &date, note, &options).await?;
            }
            EntryCommands::List { habit } => entry::run_list(habit.as_deref(), &options).await?,
            EntryCommands::Delete { habit, date } => {
                entry::run_delete(&habit, &date, &options).await?;
            }
        },
        Commands::Sync { retry_failed } => sync::run_sync(retry_failed, &options).await?,
        Commands::Status => status::run_status(&options).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List => conflicts::run_list(&options).await?,
            ConflictCommands::Resolve { id, strategy, all } => {
                conflicts::run_resolve(id.as_deref(), strategy, all, &options).await?;
            }
        },
        Commands::Integrity { command } => match command {
            IntegrityCommands::Check {
                fix,
                delete_corrupted,
            } => integrity::run_check(fix, delete_corrupted, &options).await?,
            IntegrityCommands::Recover => integrity::run_recover(&options).await?,
        },
        Commands::Migrate { to } => migrate::run_migrate(to, &options).await?,
        Commands::Backup { command } => match command {
            BackupCommands::List => backup::run_list(&options).await?,
            BackupCommands::Create { reason } => backup::run_create(&reason, &options).await?,
            BackupCommands::Restore { path } => backup::run_restore(&path, &options).await?,
        },
        Commands::Completions { shell, output } => {
            completions::run_completions(shell, output.as_deref())?;
        }
    }

    Ok(())
}

async fn run_habit(command: HabitCommands, options: &GlobalOptions) -> Result<(), CliError> {
    match command {
        HabitCommands::Add {
            name,
            description,
            color,
        } => habit::run_add(&name, description, color, options).await,
        HabitCommands::List { archived } => habit::run_list(archived, options).await,
        HabitCommands::Show { habit: query } => habit::run_show(&query, options).await,
        HabitCommands::Update {
            habit: query,
            name,
            description,
            color,
            archive,
            unarchive,
        } => {
            let update = habit_update(name, description, color, archive, unarchive);
            habit::run_update(&query, update, options).await
        }
        HabitCommands::Delete { habit: query } => habit::run_delete(&query, options).await,
    }
}

fn habit_update(
    name: Option<String>,
    description: Option<String>,
    color: Option<String>,
    archive: bool,
    unarchive: bool,
) -> HabitUpdate {
    HabitUpdate {
        name,
        description,
        color,
        archived: if archive {
            Some(true)
        } else if unarchive {
            Some(false)
        } else {
            None
        },
    }
}
