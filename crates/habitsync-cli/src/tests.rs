use chrono::NaiveDate;
use clap::{CommandFactory, Parser};
use habitsync_core::models::{AutoResolvePolicy, ConflictRecord, EntityKind, RemoteRecord, Resolution};
use habitsync_core::sync::BatchReport;
use habitsync_core::Habit;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::{Cli, Commands, CompletionShell, HabitCommands, ResolveStrategy};
use crate::commands::common::{
    format_relative_time, load_config, normalize_name, open_engine, parse_day, resolve_habit,
    short_id, GlobalOptions,
};
use crate::commands::completions::{completion_script, run_completions};
use crate::commands::conflicts::{policy_for, resolution_for};
use crate::commands::sync::format_report_lines;
use crate::error::CliError;
use crate::habit_update;

fn day(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
}

fn temp_options(dir: &tempfile::TempDir) -> GlobalOptions {
    GlobalOptions {
        db_path: Some(dir.path().join("habitsync.db")),
        config_path: Some(dir.path().join("config.json")),
        json: false,
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn global_flags_parse_after_subcommands() {
    let cli = Cli::try_parse_from([
        "habitsync",
        "habit",
        "add",
        "Morning",
        "run",
        "--json",
        "--db-path",
        "/tmp/h.db",
    ])
    .unwrap();
    assert!(cli.json);
    assert_eq!(cli.db_path.unwrap().to_str(), Some("/tmp/h.db"));
    match cli.command {
        Commands::Habit {
            command: HabitCommands::Add { name, .. },
        } => assert_eq!(name, vec!["Morning".to_string(), "run".to_string()]),
        _ => panic!("expected habit add"),
    }
}

#[test]
fn archive_flags_are_exclusive() {
    assert!(Cli::try_parse_from([
        "habitsync",
        "habit",
        "update",
        "read",
        "--archive",
        "--unarchive"
    ])
    .is_err());
}

#[test]
fn habit_update_maps_archive_flags() {
    assert_eq!(habit_update(None, None, None, true, false).archived, Some(true));
    assert_eq!(habit_update(None, None, None, false, true).archived, Some(false));
    assert!(habit_update(None, None, None, false, false).is_empty());
}

#[test]
fn parse_day_accepts_keywords_and_iso_dates() {
    let today = day("2024-03-01");
    assert_eq!(parse_day("today", today).unwrap(), today);
    assert_eq!(parse_day(" Yesterday ", today).unwrap(), day("2024-02-29"));
    assert_eq!(parse_day("2023-12-31", today).unwrap(), day("2023-12-31"));
    assert!(matches!(
        parse_day("31/12/2023", today),
        Err(CliError::InvalidDate(_))
    ));
}

#[test]
fn normalize_name_joins_and_trims() {
    let parts = vec!["  Drink".to_string(), "water ".to_string()];
    assert_eq!(normalize_name(&parts).unwrap(), "Drink water");
    assert!(matches!(
        normalize_name(&[" ".to_string()]),
        Err(CliError::EmptyName)
    ));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn short_id_truncates() {
    assert_eq!(
        short_id("tmp_0192f0c4-7b1e-7000-8000-0a1b2c3d4e5f"),
        "0a1b2c3d4e5f"
    );
    assert_eq!(short_id("habit_1"), "habit_1");
}

#[test]
fn strategies_map_to_resolutions() {
    let conflict = ConflictRecord {
        id: "c1".to_string(),
        entity_kind: EntityKind::Habit,
        entity_id: "h1".to_string(),
        local_data: json!({ "name": "Mine", "lastModified": 500 }),
        server_data: RemoteRecord {
            server_id: "h1".to_string(),
            version: 4,
            last_modified: 100,
            data: json!({ "name": "Theirs" }),
        },
        timestamp: 600,
        resolved: false,
    };
    assert_eq!(policy_for(ResolveStrategy::Merge), None);
    assert_eq!(
        policy_for(ResolveStrategy::Latest),
        Some(AutoResolvePolicy::LastWriteWins)
    );
    assert_eq!(
        resolution_for(ResolveStrategy::Latest, &conflict),
        Resolution::UseLocal
    );
    assert_eq!(
        resolution_for(ResolveStrategy::Server, &conflict),
        Resolution::UseServer
    );
    assert_eq!(
        resolution_for(ResolveStrategy::Merge, &conflict),
        Resolution::Merge
    );
}

#[test]
fn empty_report_says_nothing_to_sync() {
    assert_eq!(
        format_report_lines(&BatchReport::default()),
        vec!["Nothing to sync".to_string()]
    );
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(completion_script(CompletionShell::Bash)).unwrap();
    assert!(script.contains("habitsync"));
}

#[test]
fn completions_write_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("habitsync.fish");
    run_completions(CompletionShell::Fish, Some(&path)).unwrap();
    assert!(!std::fs::read(&path).unwrap().is_empty());
}

#[test]
fn command_line_db_path_beats_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let options = temp_options(&dir);
    std::fs::write(
        options.config_path.as_ref().unwrap(),
        r#"{ "db_path": "/elsewhere/habits.db" }"#,
    )
    .unwrap();
    let config = load_config(&options).unwrap();
    assert_eq!(config.db_path, options.db_path);
}

#[tokio::test]
async fn resolve_habit_by_name_and_id_fragment() {
    let dir = tempfile::tempdir().unwrap();
    let options = temp_options(&dir);
    let engine = open_engine(&options).await.unwrap();
    let read = engine.create_habit(Habit::new("Read")).await.unwrap();
    engine.create_habit(Habit::new("Run")).await.unwrap();

    let by_name = resolve_habit(&engine, "read").await.unwrap();
    assert_eq!(by_name.id(), read.id());
    let by_id = resolve_habit(&engine, read.id()).await.unwrap();
    assert_eq!(by_id.data.name, "Read");
    let by_suffix = resolve_habit(&engine, &short_id(read.id())).await.unwrap();
    assert_eq!(by_suffix.id(), read.id());
    assert!(matches!(
        resolve_habit(&engine, "zzz-missing").await,
        Err(CliError::HabitNotFound(_))
    ));
}
