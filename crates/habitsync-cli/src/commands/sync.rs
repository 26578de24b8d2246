use habitsync_core::sync::{BatchReport, OperationOutcome};

use crate::commands::common::{open_engine, print_json, short_id, GlobalOptions};
use crate::error::CliError;

pub async fn run_sync(retry_failed: bool, options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    if !engine.config().has_remote() {
        return Err(CliError::SyncNotConfigured);
    }
    if retry_failed {
        let retried = engine.retry_failed().await?;
        tracing::info!("Re-queued {retried} failed operations");
    }

    let report = engine.sync().await?;
    engine.close().await;

    if options.json {
        return print_json(&report);
    }
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_report_lines(report: &BatchReport) -> Vec<String> {
    if report.total == 0 {
        return vec!["Nothing to sync".to_string()];
    }
    let mut lines = vec![format!(
        "Sync completed: {} of {} operations synced, {} failed, {} conflicts, {} deferred",
        report.successful, report.total, report.failed, report.conflicts, report.deferred
    )];
    for operation in &report.operations {
        if let OperationOutcome::Failed { message, .. } = &operation.outcome {
            lines.push(format!(
                "  {:?} {} {}: {message}",
                operation.op_type,
                operation.entity_kind,
                short_id(&operation.entity_id)
            ));
        }
    }
    if report.halted {
        lines.push("  Stopped early: the network is unavailable".to_string());
    }
    lines
}
