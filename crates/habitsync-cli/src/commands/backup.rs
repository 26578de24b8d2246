use std::path::Path;

use crate::commands::common::{
    ensure_path_exists, format_relative_time, now_ms, open_engine, print_json, GlobalOptions,
};
use crate::error::CliError;

pub async fn run_list(options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let backups = engine.list_backups()?;

    if options.json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("No backups found.");
        return Ok(());
    }
    let now = now_ms();
    for backup in &backups {
        println!(
            "{}  v{}  {} records  {}  ({})",
            backup.path.display(),
            backup.schema_version,
            backup.records,
            format_relative_time(backup.created_at, now),
            backup.reason
        );
    }
    Ok(())
}

pub async fn run_create(reason: &str, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let info = engine.create_backup(reason).await?;
    if options.json {
        print_json(&info)?;
    } else {
        println!("{}", info.path.display());
    }
    Ok(())
}

pub async fn run_restore(path: &Path, options: &GlobalOptions) -> Result<(), CliError> {
    ensure_path_exists(path)?;
    let engine = open_engine(options).await?;
    let backup = engine.restore_backup(path).await?;
    println!(
        "Restored {} records from schema version {}",
        backup.record_count(),
        backup.schema_version
    );
    Ok(())
}
