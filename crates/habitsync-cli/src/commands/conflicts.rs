use habitsync_core::models::{AutoResolvePolicy, ConflictRecord, Resolution};
use habitsync_core::sync::auto_resolution;
use habitsync_core::HabitSyncEngine;

use crate::cli::ResolveStrategy;
use crate::commands::common::{format_conflict_line, now_ms, open_engine, print_json, GlobalOptions};
use crate::error::CliError;

pub async fn run_list(options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let conflicts = engine.conflicts().await?;

    if options.json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }
    let now = now_ms();
    for conflict in &conflicts {
        println!("{}", format_conflict_line(conflict, now));
    }
    Ok(())
}

pub async fn run_resolve(
    id: Option<&str>,
    strategy: ResolveStrategy,
    all: bool,
    options: &GlobalOptions,
) -> Result<(), CliError> {
    let engine = open_engine(options).await?;

    if all {
        let resolved = match policy_for(strategy) {
            Some(policy) => engine.resolve_conflicts(Some(policy)).await?,
            None => {
                let mut resolved = 0;
                for conflict in engine.conflicts().await? {
                    engine.resolve_conflict(&conflict.id, Resolution::Merge).await?;
                    resolved += 1;
                }
                resolved
            }
        };
        println!("Resolved {resolved} conflicts");
        return Ok(());
    }

    let query = id.ok_or(CliError::MissingConflictId)?;
    let conflict = find_conflict(&engine, query).await?;
    let resolution = resolution_for(strategy, &conflict);
    let op_id = engine.resolve_conflict(&conflict.id, resolution).await?;
    println!("{} (queued update {op_id})", conflict.id);
    Ok(())
}

pub const fn policy_for(strategy: ResolveStrategy) -> Option<AutoResolvePolicy> {
    match strategy {
        ResolveStrategy::Local => Some(AutoResolvePolicy::LocalWins),
        ResolveStrategy::Server => Some(AutoResolvePolicy::ServerWins),
        ResolveStrategy::Latest => Some(AutoResolvePolicy::LastWriteWins),
        ResolveStrategy::Merge => None,
    }
}

pub fn resolution_for(strategy: ResolveStrategy, conflict: &ConflictRecord) -> Resolution {
    policy_for(strategy).map_or(Resolution::Merge, |policy| {
        auto_resolution(policy, conflict)
    })
}

async fn find_conflict(engine: &HabitSyncEngine, query: &str) -> Result<ConflictRecord, CliError> {
    let mut matching = engine
        .conflicts()
        .await?
        .into_iter()
        .filter(|conflict| {
            conflict.id.starts_with(query.trim()) || conflict.id.ends_with(query.trim())
        })
        .collect::<Vec<_>>();
    match matching.len() {
        1 => Ok(matching.remove(0)),
        0 => Err(habitsync_core::Error::NotFound(format!("conflict {query}")).into()),
        _ => Err(CliError::Config(format!(
            "conflict id '{query}' is ambiguous"
        ))),
    }
}
