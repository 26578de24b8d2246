use serde::Serialize;

use crate::commands::common::{open_engine, print_json, GlobalOptions};
use crate::error::CliError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrateOutput {
    applied: Vec<u32>,
    current_version: u32,
}

pub async fn run_migrate(to: Option<u32>, options: &GlobalOptions) -> Result<(), CliError> {
    // Opening the engine already applies pending migrations.
    let engine = open_engine(options).await?;
    let applied = match to {
        Some(version) => engine.migrate_to(version).await?,
        None => engine.migrate().await?,
    };
    let current_version = engine.migration_status().await?.current_version;

    if options.json {
        return print_json(&MigrateOutput {
            applied,
            current_version,
        });
    }
    if applied.is_empty() {
        println!("Schema is at version {current_version}");
    } else {
        let steps = applied
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("Applied {steps}; schema is at version {current_version}");
    }
    Ok(())
}
