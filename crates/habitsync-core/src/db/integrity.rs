//! Structural audit and repair of stored records

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backup::{BackupInfo, BackupManager};
use super::connection::Store;
use super::migrations::backfill_sync_meta;
use super::schema::{HABITS, HABIT_ENTRIES, SYNC_QUEUE};
use super::transaction::{StoreTransaction, TransactionMode};
use crate::config::IntegrityConfig;
use crate::error::Result;
use crate::models::{domain_fields, EntityKind, OperationStatus, OperationType, SyncOperation};
use crate::sync::clock::Clock;
use crate::sync::processor::purge_entity_in;
use crate::sync::queue::{self, SyncQueue};

const SYNC_FIELDS: [&str; 4] = ["version", "lastModified", "synced", "deleted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    MissingField,
    InvalidValue,
    Duplicate,
    Orphan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub collection: String,
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    pub auto_fixable: bool,
}

impl IntegrityIssue {
    fn new(
        kind: IssueKind,
        severity: Severity,
        collection: &str,
        record_id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            collection: collection.to_string(),
            record_id: record_id.to_string(),
            field: None,
            message: message.into(),
            auto_fixable: false,
        }
    }

    fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    const fn fixable(mut self) -> Self {
        self.auto_fixable = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Healthy,
    Warning,
    Corrupted,
}

impl IntegrityStatus {
    fn classify(issues: &[IntegrityIssue], corruption_threshold: usize) -> Self {
        if issues.is_empty() {
            Self::Healthy
        } else if issues.len() >= corruption_threshold
            || issues.iter().any(|issue| issue.severity == Severity::Critical)
        {
            Self::Corrupted
        } else {
            Self::Warning
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityOptions {
    /// Repair issues marked `auto_fixable`
    pub auto_fix: bool,
    /// Hard-delete records with unfixable critical issues
    pub delete_corrupted_entries: bool,
    /// Issue count at which the store counts as corrupted
    pub corruption_threshold: usize,
}

impl Default for IntegrityOptions {
    fn default() -> Self {
        Self::from_config(&IntegrityConfig::default())
    }
}

impl IntegrityOptions {
    pub const fn from_config(config: &IntegrityConfig) -> Self {
        Self {
            auto_fix: false,
            delete_corrupted_entries: false,
            corruption_threshold: config.corruption_threshold,
        }
    }

    #[must_use]
    pub const fn with_auto_fix(mut self) -> Self {
        self.auto_fix = true;
        self
    }

    #[must_use]
    pub const fn with_delete_corrupted(mut self) -> Self {
        self.delete_corrupted_entries = true;
        self
    }
}

/// Result of one audit. `status` and `issues` describe the store as found,
/// before any repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub checked_at: i64,
    pub records_checked: usize,
    pub issues_found: usize,
    pub issues: Vec<IntegrityIssue>,
    pub fixed: usize,
    pub deleted: usize,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.status == IntegrityStatus::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub recovered: bool,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupInfo>,
    pub initial: IntegrityReport,
    pub last: IntegrityReport,
}

/// Audits the habit, entry and queue collections and repairs what it can.
pub struct IntegrityChecker {
    store: Arc<Store>,
    queue: Arc<SyncQueue>,
    clock: Arc<dyn Clock>,
    backups: Option<Arc<BackupManager>>,
}

impl IntegrityChecker {
    pub fn new(store: Arc<Store>, queue: Arc<SyncQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
            backups: None,
        }
    }

    #[must_use]
    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Audit the store and, when enabled, repair or delete what was found.
    pub async fn check(&self, options: IntegrityOptions) -> Result<IntegrityReport> {
        let (records_checked, issues) = self
            .store
            .transaction(
                &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                TransactionMode::ReadOnly,
                |tx| audit_in(tx),
            )
            .await?;

        let status = IntegrityStatus::classify(&issues, options.corruption_threshold);
        let mut report = IntegrityReport {
            status,
            checked_at: self.clock.now_millis(),
            records_checked,
            issues_found: issues.len(),
            issues,
            fixed: 0,
            deleted: 0,
        };

        if (options.auto_fix || options.delete_corrupted_entries) && !report.issues.is_empty() {
            let now = report.checked_at;
            let queue = Arc::clone(&self.queue);
            let issues = report.issues.clone();
            let (fixed, deleted) = self
                .store
                .transaction(
                    &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                    TransactionMode::ReadWrite,
                    move |tx| Self::repair_in(&queue, tx, &issues, options, now),
                )
                .await?;
            report.fixed = fixed;
            report.deleted = deleted;
        }

        match report.status {
            IntegrityStatus::Healthy => tracing::info!(
                "Integrity check passed ({} records)",
                report.records_checked
            ),
            status => tracing::warn!(
                "Integrity check found {} issues ({status:?}); fixed {}, deleted {}",
                report.issues_found,
                report.fixed,
                report.deleted
            ),
        }
        Ok(report)
    }

    /// Back up, then repair and re-check up to `max_attempts` times.
    pub async fn recover(&self, max_attempts: u32) -> Result<RecoveryReport> {
        let backup = match &self.backups {
            Some(backups) => Some(backups.create(&self.store, "before recovery").await?),
            None => {
                tracing::warn!("No backup directory configured; recovering without a backup");
                None
            }
        };

        let audit_only = IntegrityOptions::default();
        let repair = audit_only.with_auto_fix().with_delete_corrupted();
        let initial = self.check(audit_only).await?;
        let mut last = initial.clone();
        let mut attempts = 0;

        while !last.is_healthy() && attempts < max_attempts.max(1) {
            attempts += 1;
            self.check(repair).await?;
            last = self.check(audit_only).await?;
            tracing::info!(
                "Recovery attempt {attempts}: {} issues remain",
                last.issues_found
            );
        }

        Ok(RecoveryReport {
            recovered: last.is_healthy(),
            attempts,
            backup,
            initial,
            last,
        })
    }

    fn repair_in(
        queue: &SyncQueue,
        tx: &mut StoreTransaction<'_>,
        issues: &[IntegrityIssue],
        options: IntegrityOptions,
        now: i64,
    ) -> Result<(usize, usize)> {
        let mut fixed = 0;
        let mut deleted = 0;
        let mut removed: HashSet<(String, String)> = HashSet::new();

        for issue in issues {
            let key = (issue.collection.clone(), issue.record_id.clone());
            if removed.contains(&key) {
                continue;
            }
            if issue.auto_fixable && options.auto_fix {
                if Self::fix_in(queue, tx, issue, now)? {
                    removed.insert(key);
                }
                fixed += 1;
            } else if issue.severity == Severity::Critical && options.delete_corrupted_entries {
                let kind = if issue.collection == HABITS {
                    EntityKind::Habit
                } else {
                    EntityKind::HabitEntry
                };
                purge_entity_in(tx, kind, &issue.record_id, None)?;
                tracing::warn!(
                    "Deleted corrupted {} record {}: {}",
                    issue.collection,
                    issue.record_id,
                    issue.message
                );
                removed.insert(key);
                deleted += 1;
            }
        }
        Ok((fixed, deleted))
    }

    /// Apply one automatic fix. Returns whether the record is gone afterwards.
    fn fix_in(
        queue: &SyncQueue,
        tx: &mut StoreTransaction<'_>,
        issue: &IntegrityIssue,
        now: i64,
    ) -> Result<bool> {
        match issue.kind {
            IssueKind::Orphan if issue.collection == SYNC_QUEUE => {
                tx.delete(SYNC_QUEUE, &issue.record_id)?;
                Ok(true)
            }
            IssueKind::Duplicate => Self::retire_duplicate_in(queue, tx, &issue.record_id, now),
            IssueKind::MissingField => {
                let Some(mut document) = tx.get(&issue.collection, &issue.record_id)? else {
                    return Ok(true);
                };
                let mut changed = backfill_sync_meta(&mut document, now);
                if issue.field.as_deref() == Some("completed") {
                    document["completed"] = Value::Bool(true);
                    changed = true;
                }
                if changed {
                    tx.put(&issue.collection, &document)?;
                }
                Ok(false)
            }
            IssueKind::Orphan | IssueKind::InvalidValue => Ok(false),
        }
    }

    /// Soft-delete a duplicate habit and tell the server, or drop it locally
    /// when the server never saw it.
    fn retire_duplicate_in(
        queue: &SyncQueue,
        tx: &mut StoreTransaction<'_>,
        id: &str,
        now: i64,
    ) -> Result<bool> {
        let Some(mut document) = tx.get(HABITS, id)? else {
            return Ok(true);
        };
        if document.get("serverId").and_then(Value::as_str).is_none() {
            purge_entity_in(tx, EntityKind::Habit, id, None)?;
            tracing::warn!("Removed unsynced duplicate habit {id}");
            return Ok(true);
        }

        backfill_sync_meta(&mut document, now);
        let version = document["version"].as_u64().unwrap_or(1) + 1;
        document["version"] = Value::from(version);
        document["lastModified"] = Value::from(now);
        document["synced"] = Value::Bool(false);
        document["deleted"] = Value::Bool(true);
        tx.put(HABITS, &document)?;
        queue.enqueue_in(
            tx,
            SyncOperation::new(
                OperationType::Delete,
                EntityKind::Habit,
                id,
                domain_fields(&document),
            )
            .with_entity_version(version),
        )?;
        tracing::warn!("Soft-deleted duplicate habit {id}");
        Ok(false)
    }
}

fn is_deleted(document: &Value) -> bool {
    document.get("deleted").and_then(Value::as_bool) == Some(true)
}

fn record_id(document: &Value) -> String {
    document
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn text<'a>(document: &'a Value, field: &str) -> Option<&'a str> {
    document
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn missing_sync_fields(collection: &str, id: &str, document: &Value) -> Vec<IntegrityIssue> {
    SYNC_FIELDS
        .iter()
        .filter(|field| document.get(**field).map_or(true, Value::is_null))
        .map(|field| {
            IntegrityIssue::new(
                IssueKind::MissingField,
                Severity::Medium,
                collection,
                id,
                format!("missing sync field '{field}'"),
            )
            .on_field(field)
            .fixable()
        })
        .collect()
}

/// Scan every collection. Returns the number of records looked at and the issues.
fn audit_in(tx: &StoreTransaction<'_>) -> Result<(usize, Vec<IntegrityIssue>)> {
    let habits = tx.get_all(HABITS)?;
    let entries = tx.get_all(HABIT_ENTRIES)?;
    let operations = queue::all_in(tx)?;
    let mut issues = Vec::new();
    let mut checked = 0;

    let habit_ids: HashSet<String> = habits.iter().map(record_id).collect();
    let entry_ids: HashSet<String> = entries.iter().map(record_id).collect();

    // Newest habit per domain key; every other one is a duplicate.
    let mut by_key: HashMap<String, Vec<&Value>> = HashMap::new();

    for habit in habits.iter().filter(|habit| !is_deleted(habit)) {
        checked += 1;
        let id = record_id(habit);
        issues.extend(missing_sync_fields(HABITS, &id, habit));
        match text(habit, "name") {
            None => issues.push(
                IntegrityIssue::new(
                    IssueKind::MissingField,
                    Severity::Critical,
                    HABITS,
                    &id,
                    "habit has no name",
                )
                .on_field("name"),
            ),
            Some(name) => {
                if name.chars().count() > crate::models::MAX_NAME_LEN {
                    issues.push(
                        IntegrityIssue::new(
                            IssueKind::InvalidValue,
                            Severity::Medium,
                            HABITS,
                            &id,
                            "habit name is too long",
                        )
                        .on_field("name"),
                    );
                }
                by_key.entry(name.to_lowercase()).or_default().push(habit);
            }
        }
    }

    for (key, mut group) in by_key {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|habit| {
            (
                habit.get("lastModified").and_then(Value::as_i64).unwrap_or(0),
                habit.get("version").and_then(Value::as_u64).unwrap_or(0),
                record_id(habit),
            )
        });
        let Some((kept, duplicates)) = group.split_last() else {
            continue;
        };
        for duplicate in duplicates {
            issues.push(
                IntegrityIssue::new(
                    IssueKind::Duplicate,
                    Severity::High,
                    HABITS,
                    &record_id(duplicate),
                    format!("duplicate of habit {} ('{key}')", record_id(kept)),
                )
                .fixable(),
            );
        }
    }

    for entry in entries.iter().filter(|entry| !is_deleted(entry)) {
        checked += 1;
        let id = record_id(entry);
        issues.extend(missing_sync_fields(HABIT_ENTRIES, &id, entry));
        match text(entry, "habitId") {
            None => issues.push(
                IntegrityIssue::new(
                    IssueKind::MissingField,
                    Severity::Critical,
                    HABIT_ENTRIES,
                    &id,
                    "entry has no habit",
                )
                .on_field("habitId"),
            ),
            Some(habit_id) if !habit_ids.contains(habit_id) => issues.push(
                IntegrityIssue::new(
                    IssueKind::Orphan,
                    Severity::Critical,
                    HABIT_ENTRIES,
                    &id,
                    format!("entry references missing habit {habit_id}"),
                )
                .on_field("habitId"),
            ),
            Some(_) => {}
        }
        match text(entry, "date") {
            None => issues.push(
                IntegrityIssue::new(
                    IssueKind::MissingField,
                    Severity::Critical,
                    HABIT_ENTRIES,
                    &id,
                    "entry has no date",
                )
                .on_field("date"),
            ),
            Some(date) if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() => issues.push(
                IntegrityIssue::new(
                    IssueKind::InvalidValue,
                    Severity::Critical,
                    HABIT_ENTRIES,
                    &id,
                    format!("entry date {date:?} is not YYYY-MM-DD"),
                )
                .on_field("date"),
            ),
            Some(_) => {}
        }
        if !entry.get("completed").is_some_and(Value::is_boolean) {
            issues.push(
                IntegrityIssue::new(
                    IssueKind::MissingField,
                    Severity::Low,
                    HABIT_ENTRIES,
                    &id,
                    "entry has no completion flag",
                )
                .on_field("completed")
                .fixable(),
            );
        }
    }

    for op in operations
        .iter()
        .filter(|op| op.status != OperationStatus::Completed)
    {
        checked += 1;
        let known = match op.entity_kind {
            EntityKind::Habit => &habit_ids,
            EntityKind::HabitEntry => &entry_ids,
        };
        if !known.contains(&op.entity_id) {
            issues.push(
                IntegrityIssue::new(
                    IssueKind::Orphan,
                    Severity::Medium,
                    SYNC_QUEUE,
                    &op.id,
                    format!(
                        "{:?} operation targets missing {} {}",
                        op.op_type, op.entity_kind, op.entity_id
                    ),
                )
                .fixable(),
            );
        }
    }

    Ok((checked, issues))
}
