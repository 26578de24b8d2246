use habitsync_core::connectivity::QualitySample;
use habitsync_core::SyncStatus;
use serde::Serialize;

use crate::commands::common::{format_relative_time, now_ms, open_engine, print_json, GlobalOptions};
use crate::error::CliError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOutput {
    #[serde(flatten)]
    status: SyncStatus,
    network: Option<QualitySample>,
    schema_version: u32,
}

pub async fn run_status(options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let network = engine.check_connectivity().await;
    let status = engine.status().await?;
    let schema_version = engine.migration_status().await?.current_version;

    if options.json {
        return print_json(&StatusOutput {
            status,
            network,
            schema_version,
        });
    }
    for line in format_status_lines(&status, network.as_ref(), now_ms()) {
        println!("{line}");
    }
    println!("schema:     v{schema_version}");
    Ok(())
}

pub fn format_status_lines(
    status: &SyncStatus,
    network: Option<&QualitySample>,
    now_ms: i64,
) -> Vec<String> {
    let mut lines = vec![format!("state:      {:?}", status.state).to_lowercase()];
    if !status.remote_configured {
        lines.push("remote:     not configured (local-only)".to_string());
    }
    match network {
        Some(sample) if sample.reachable => lines.push(format!(
            "network:    reachable, {:?} quality{}",
            sample.quality,
            sample
                .latency_ms
                .map(|latency| format!(", {latency}ms"))
                .unwrap_or_default()
        )),
        Some(_) => lines.push("network:    unreachable".to_string()),
        None => {}
    }
    lines.push(format!("pending:    {}", status.pending_operations));
    if status.failed_operations > 0 {
        lines.push(format!("failed:     {}", status.failed_operations));
    }
    if status.unresolved_conflicts > 0 {
        lines.push(format!("conflicts:  {}", status.unresolved_conflicts));
    }
    lines.push(match status.last_sync_at {
        Some(at) => format!("last sync:  {}", format_relative_time(at, now_ms)),
        None => "last sync:  never".to_string(),
    });
    lines
}
