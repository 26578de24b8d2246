use habitsync_core::db::{IntegrityReport, IntegrityStatus};

use crate::commands::common::{open_engine, print_json, GlobalOptions};
use crate::error::CliError;

pub async fn run_check(
    fix: bool,
    delete_corrupted: bool,
    options: &GlobalOptions,
) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let mut check = engine.integrity_options();
    if fix {
        check = check.with_auto_fix();
    }
    if delete_corrupted {
        check = check.with_delete_corrupted();
    }
    let report = engine.run_integrity_check(check).await?;

    if options.json {
        print_json(&report)?;
    } else {
        for line in format_report_lines(&report) {
            println!("{line}");
        }
    }
    if report.status == IntegrityStatus::Corrupted && !fix && !delete_corrupted {
        return Err(CliError::Corrupted(
            "run `habitsync integrity recover` or check with --fix".to_string(),
        ));
    }
    Ok(())
}

pub async fn run_recover(options: &GlobalOptions) -> Result<(), CliError> {
    let engine = open_engine(options).await?;
    let report = engine.recover().await?;

    if options.json {
        return print_json(&report);
    }
    if let Some(backup) = &report.backup {
        println!("Backup: {}", backup.path.display());
    }
    println!(
        "Recovered after {} attempt(s): {} issues found initially",
        report.attempts, report.initial.issues_found
    );
    Ok(())
}

pub fn format_report_lines(report: &IntegrityReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{:?}: {} records checked, {} issues",
        report.status, report.records_checked, report.issues_found
    )];
    for issue in &report.issues {
        let fix = if issue.auto_fixable { " (fixable)" } else { "" };
        lines.push(format!(
            "  [{:?}] {}/{}: {}{fix}",
            issue.severity, issue.collection, issue.record_id, issue.message
        ));
    }
    if report.fixed > 0 || report.deleted > 0 {
        lines.push(format!("Fixed {}, deleted {}", report.fixed, report.deleted));
    }
    lines
}
