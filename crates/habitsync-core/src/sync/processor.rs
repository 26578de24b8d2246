//! Outbox drain: batches, lanes and folding server responses back

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::db::schema::{CONFLICTS, HABITS, HABIT_ENTRIES, METADATA, SYNC_QUEUE};
use crate::db::{Store, StoreTransaction, TransactionMode};
use crate::error::{Error, FailureClass, Result};
use crate::models::{
    domain_fields, EntityKind, OperationStatus, OperationType, RemoteRecord, SyncMeta,
    SyncOperation,
};
use crate::sync::clock::Clock;
use crate::sync::conflicts::{compose, ConflictManager};
use crate::sync::queue::{self, SyncQueue};
use crate::sync::remote::{RemoteApi, ToggleRequest};

/// Metadata document holding the time of the last clean pass
pub const LAST_SYNC_KEY: &str = "lastSyncAt";

/// What happened to one operation during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum OperationOutcome {
    Synced,
    Conflict { conflict_id: String },
    Failed { class: FailureClass, message: String },
    /// Not attempted: an earlier operation on the same entity failed, the
    /// pass halted on a network error, or the entry's habit has no server id yet
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub operation_id: String,
    pub op_type: OperationType,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    #[serde(flatten)]
    pub outcome: OperationOutcome,
}

/// Summary of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub network_errors: usize,
    pub conflicts: usize,
    pub deferred: usize,
    /// Later chunks were skipped after a network-class failure
    pub halted: bool,
    pub operations: Vec<OperationReport>,
}

impl BatchReport {
    fn record(&mut self, report: OperationReport) {
        match &report.outcome {
            OperationOutcome::Synced => self.successful += 1,
            OperationOutcome::Conflict { .. } => self.conflicts += 1,
            OperationOutcome::Failed { class, .. } => {
                self.failed += 1;
                if *class == FailureClass::Network {
                    self.network_errors += 1;
                }
            }
            OperationOutcome::Deferred => self.deferred += 1,
        }
        self.operations.push(report);
    }

    fn defer(&mut self, op: &SyncOperation) {
        self.record(report_for(op, OperationOutcome::Deferred));
    }
}

fn report_for(op: &SyncOperation, outcome: OperationOutcome) -> OperationReport {
    OperationReport {
        operation_id: op.id.clone(),
        op_type: op.op_type,
        entity_kind: op.entity_kind,
        entity_id: op.entity_id.clone(),
        outcome,
    }
}

/// Result of the remote call for one operation
enum RemoteEffect {
    Upserted(RemoteRecord),
    Removed,
    /// Nothing sent: the owning habit has not reached the server yet
    Blocked,
}

/// Ops that must run in order: everything touching one habit and its entries.
struct Lane {
    key: String,
    ops: Vec<SyncOperation>,
}

/// Drains the sync queue against the remote.
pub struct SyncProcessor {
    store: Arc<Store>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictManager>,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncProcessor {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<SyncQueue>,
        conflicts: Arc<ConflictManager>,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            conflicts,
            remote,
            clock,
            config,
        }
    }

    /// Process every ready operation once.
    ///
    /// Chunks of `batch_size` run one after another. Inside a chunk, lanes run
    /// concurrently up to `max_concurrent_requests` and each lane runs its
    /// operations in queue order. A network-class failure stops later chunks.
    pub async fn process_pending(&self) -> Result<BatchReport> {
        let ready = self.queue.get_ready().await?;
        let mut report = BatchReport {
            total: ready.len(),
            ..BatchReport::default()
        };
        if ready.is_empty() {
            self.finish_pass(&report).await?;
            return Ok(report);
        }

        tracing::info!("Sync pass started with {} operations", ready.len());
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.max_concurrent_requests.max(1);
        let mut blocked: HashSet<String> = HashSet::new();
        let mut chunks = ready.chunks(batch_size);

        for chunk in chunks.by_ref() {
            let mut lanes = Vec::new();
            for lane in into_lanes(chunk) {
                if blocked.contains(&lane.key) {
                    lane.ops.iter().for_each(|op| report.defer(op));
                } else {
                    lanes.push(lane);
                }
            }

            let results: Vec<(String, Vec<OperationReport>)> = stream::iter(lanes)
                .map(|lane| self.run_lane(lane))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut network_error = false;
            for (key, reports) in results {
                for op_report in reports {
                    match &op_report.outcome {
                        OperationOutcome::Failed { class, .. } => {
                            network_error |= *class == FailureClass::Network;
                            blocked.insert(key.clone());
                        }
                        OperationOutcome::Deferred => {
                            blocked.insert(key.clone());
                        }
                        _ => {}
                    }
                    report.record(op_report);
                }
            }

            if network_error {
                report.halted = true;
                break;
            }
        }

        for op in chunks.flatten() {
            report.defer(op);
        }

        self.finish_pass(&report).await?;
        tracing::info!(
            "Sync pass finished: {} synced, {} failed ({} network), {} conflicts, {} deferred",
            report.successful,
            report.failed,
            report.network_errors,
            report.conflicts,
            report.deferred
        );
        Ok(report)
    }

    async fn run_lane(&self, lane: Lane) -> (String, Vec<OperationReport>) {
        let mut reports = Vec::with_capacity(lane.ops.len());
        let mut failed = false;
        for op in &lane.ops {
            if failed {
                reports.push(report_for(op, OperationOutcome::Deferred));
                continue;
            }
            let Some(report) = self.process_operation(op).await else {
                continue;
            };
            failed = matches!(
                report.outcome,
                OperationOutcome::Failed { .. } | OperationOutcome::Deferred
            );
            reports.push(report);
        }
        (lane.key, reports)
    }

    /// Run one operation and persist its outcome.
    ///
    /// Returns `None` when the operation vanished or completed since the
    /// pass started.
    async fn process_operation(&self, snapshot: &SyncOperation) -> Option<OperationReport> {
        // Re-read: an earlier op in this lane may have re-keyed it.
        let op = match self.queue.get(&snapshot.id).await {
            Ok(Some(op)) if op.is_ready() => op,
            Ok(_) => return None,
            Err(error) => {
                return Some(report_for(
                    snapshot,
                    OperationOutcome::Failed {
                        class: error.failure_class(),
                        message: error.to_string(),
                    },
                ))
            }
        };

        tracing::debug!(
            "Processing {:?} {} {} ({})",
            op.op_type,
            op.entity_kind,
            op.entity_id,
            op.id
        );
        match self.execute(&op).await {
            Ok(outcome) => Some(report_for(&op, outcome)),
            Err(error) => {
                let class = error.failure_class();
                let message = error.to_string();
                tracing::warn!(
                    "Sync operation {} ({:?} {} {}) failed: {message}",
                    op.id,
                    op.op_type,
                    op.entity_kind,
                    op.entity_id
                );
                if let Err(mark_error) = self
                    .queue
                    .mark_failed_with_class(&op.id, &message, class)
                    .await
                {
                    tracing::warn!("Failed to record failure of {}: {mark_error}", op.id);
                }
                Some(report_for(&op, OperationOutcome::Failed { class, message }))
            }
        }
    }

    async fn execute(&self, op: &SyncOperation) -> Result<OperationOutcome> {
        let collection = op.entity_kind.collection();
        let local = self.store.get(collection, &op.entity_id).await?;

        let effect = match op.entity_kind {
            EntityKind::Habit => self.call_habit(op, local.as_ref()).await?,
            EntityKind::HabitEntry => self.call_entry(op, local.as_ref()).await?,
        };
        if matches!(effect, RemoteEffect::Blocked) {
            return Ok(OperationOutcome::Deferred);
        }

        let queue = self.queue.clone();
        let conflicts = self.conflicts.clone();
        let op = op.clone();
        self.store
            .transaction(
                &[HABITS, HABIT_ENTRIES, SYNC_QUEUE, CONFLICTS],
                TransactionMode::ReadWrite,
                move |tx| match effect {
                    RemoteEffect::Upserted(remote) => {
                        apply_upsert_in(&queue, &conflicts, tx, &op, &remote)
                    }
                    RemoteEffect::Removed => apply_removed_in(tx, &op),
                    RemoteEffect::Blocked => Ok(OperationOutcome::Deferred),
                },
            )
            .await
    }

    async fn call_habit(&self, op: &SyncOperation, local: Option<&Value>) -> Result<RemoteEffect> {
        let remote_id = remote_id(op, local);
        match op.op_type {
            OperationType::Create => Ok(RemoteEffect::Upserted(
                self.remote
                    .create_entity(EntityKind::Habit, &op.payload)
                    .await?,
            )),
            OperationType::Update => Ok(RemoteEffect::Upserted(
                self.remote
                    .update_entity(EntityKind::Habit, &remote_id, &op.payload)
                    .await?,
            )),
            OperationType::Delete => {
                match self.remote.delete_entity(EntityKind::Habit, &remote_id).await {
                    Ok(()) => Ok(RemoteEffect::Removed),
                    // Already gone remotely: the delete has nothing left to do.
                    Err(error) if error.failure_class() == FailureClass::NotFound => {
                        Ok(RemoteEffect::Removed)
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    async fn call_entry(&self, op: &SyncOperation, local: Option<&Value>) -> Result<RemoteEffect> {
        let parent = op
            .parent_id
            .clone()
            .or_else(|| field_str(&op.payload, "habitId"))
            .or_else(|| local.and_then(|doc| field_str(doc, "habitId")))
            .ok_or_else(|| {
                Error::ValidationFailed(format!("entry {} has no parent habit", op.entity_id))
            })?;
        let habit = self
            .store
            .get(HABITS, &parent)
            .await?
            .ok_or_else(|| Error::NotFound(format!("habit {parent} does not exist locally")))?;
        let Some(habit_server_id) = field_str(&habit, "serverId") else {
            tracing::debug!(
                "Entry {} waits for habit {parent} to reach the server",
                op.entity_id
            );
            return Ok(RemoteEffect::Blocked);
        };
        let date = field_str(&op.payload, "date")
            .or_else(|| local.and_then(|doc| field_str(doc, "date")))
            .ok_or_else(|| {
                Error::ValidationFailed(format!("entry {} has no date", op.entity_id))
            })?;

        let request = ToggleRequest {
            habit_id: habit_server_id,
            date,
            completed: op.op_type != OperationType::Delete
                && op
                    .payload
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            note: field_str(&op.payload, "note"),
            entry_id: local.and_then(|doc| field_str(doc, "serverId")),
        };
        let response = self.remote.toggle_completion(&request).await?;

        match (op.op_type, response) {
            (OperationType::Delete, _) => Ok(RemoteEffect::Removed),
            (_, Some(record)) => Ok(RemoteEffect::Upserted(record)),
            (_, None) => Err(Error::NotFound(format!(
                "remote returned no entry for {} on {}",
                request.habit_id, request.date
            ))),
        }
    }

    async fn finish_pass(&self, report: &BatchReport) -> Result<()> {
        let now = self.clock.now_millis();
        let clean = report.failed == 0 && report.deferred == 0;
        self.store
            .transaction(&[SYNC_QUEUE, METADATA], TransactionMode::ReadWrite, move |tx| {
                for op in queue::all_in(tx)? {
                    if op.status == OperationStatus::Completed {
                        tx.delete(SYNC_QUEUE, &op.id)?;
                    }
                }
                if clean {
                    tx.put(METADATA, &json!({ "id": LAST_SYNC_KEY, "value": now }))?;
                }
                Ok(())
            })
            .await
    }

    /// Time of the last pass that finished without failures.
    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get(METADATA, LAST_SYNC_KEY)
            .await?
            .and_then(|doc| doc.get("value").and_then(Value::as_i64)))
    }
}

/// Fold a server representation into the local record.
fn apply_upsert_in(
    queue: &SyncQueue,
    conflicts: &ConflictManager,
    tx: &mut StoreTransaction<'_>,
    op: &SyncOperation,
    remote: &RemoteRecord,
) -> Result<OperationOutcome> {
    let collection = op.entity_kind.collection();
    let Some(local) = tx.get(collection, &op.entity_id)? else {
        if op.op_type == OperationType::Create {
            delete_orphan_in(queue, tx, op, remote)?;
        }
        complete_if_unchanged_in(tx, op)?;
        return Ok(OperationOutcome::Synced);
    };

    if op.op_type == OperationType::Update && ConflictManager::detect_conflict(&local, remote) {
        let conflict =
            conflicts.record_conflict_in(tx, op.entity_kind, &op.entity_id, &local, remote)?;
        queue::mark_completed_in(tx, &op.id)?;
        return Ok(OperationOutcome::Conflict {
            conflict_id: conflict.id,
        });
    }

    let mut meta: SyncMeta = serde_json::from_value(local.clone())?;
    let local_data = domain_fields(&local);
    // Edited again while the request was in flight: keep the newer local
    // state and only record what the server acknowledged.
    let edited_since = meta.version > op.entity_version;
    let data = if edited_since {
        local_data
    } else {
        overlay(local_data, &remote.data)
    };

    let old_id = meta.id.clone();
    let rekey = op.op_type == OperationType::Create && old_id != remote.server_id;
    if op.op_type == OperationType::Create {
        meta.id.clone_from(&remote.server_id);
        meta.temp_id = None;
    }
    meta.server_id = Some(remote.server_id.clone());
    meta.server_version = Some(remote.version);
    meta.synced = !edited_since;

    if rekey {
        // Free the unique (habitId, date) slot before writing the new key.
        tx.delete(collection, &old_id)?;
    }
    tx.put(collection, &compose(&meta, &data)?)?;

    if rekey {
        queue::rekey_entity_in(tx, &old_id, &remote.server_id)?;
        if op.entity_kind == EntityKind::Habit {
            repoint_entries_in(tx, &old_id, &remote.server_id)?;
        }
        tracing::debug!(
            "Re-keyed {} {old_id} to server id {}",
            op.entity_kind,
            remote.server_id
        );
    }

    complete_if_unchanged_in(tx, op)?;
    Ok(OperationOutcome::Synced)
}

/// The record was deleted locally while its CREATE was in flight, so the
/// server now holds a copy nobody will ever delete. Queue that DELETE.
///
/// An entry re-created for the same habit and day since then keeps the
/// server copy; its own CREATE lands on the same slot.
fn delete_orphan_in(
    queue: &SyncQueue,
    tx: &mut StoreTransaction<'_>,
    op: &SyncOperation,
    remote: &RemoteRecord,
) -> Result<()> {
    if op.entity_kind == EntityKind::HabitEntry {
        let habit_id = op
            .parent_id
            .clone()
            .or_else(|| field_str(&op.payload, "habitId"));
        if let (Some(habit_id), Some(date)) = (habit_id, field_str(&op.payload, "date")) {
            let key = Value::Array(vec![Value::from(habit_id), Value::from(date)]);
            let replaced = tx
                .get_by_index(HABIT_ENTRIES, "habitId_date", &key)?
                .iter()
                .any(|entry| !entry.get("deleted").and_then(Value::as_bool).unwrap_or(false));
            if replaced {
                return Ok(());
            }
        }
    }
    tracing::info!(
        "{} {} was deleted while its create was in flight; deleting server copy {}",
        op.entity_kind,
        op.entity_id,
        remote.server_id
    );
    queue.enqueue_in(
        tx,
        SyncOperation::new(
            OperationType::Delete,
            op.entity_kind,
            &remote.server_id,
            op.payload.clone(),
        )
        .with_parent(op.parent_id.clone()),
    )?;
    Ok(())
}

/// Group a chunk into ordered lanes, keeping first-seen lane order.
fn into_lanes(chunk: &[SyncOperation]) -> Vec<Lane> {
    let mut lanes: Vec<Lane> = Vec::new();
    for op in chunk {
        let key = op.lane_key();
        match lanes.iter_mut().find(|lane| lane.key == key) {
            Some(lane) => lane.ops.push(op.clone()),
            None => lanes.push(Lane {
                key: key.to_string(),
                ops: vec![op.clone()],
            }),
        }
    }
    lanes
}

fn remote_id(op: &SyncOperation, local: Option<&Value>) -> String {
    local
        .and_then(|doc| field_str(doc, "serverId"))
        .unwrap_or_else(|| op.entity_id.clone())
}

fn field_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn overlay(mut base: Value, fields: &Value) -> Value {
    if let (Value::Object(base), Value::Object(fields)) = (&mut base, fields) {
        for (key, value) in fields {
            base.insert(key.clone(), value.clone());
        }
    }
    base
}

/// Complete `op` unless a later UPDATE was merged into it mid-flight.
fn complete_if_unchanged_in(tx: &mut StoreTransaction<'_>, op: &SyncOperation) -> Result<()> {
    match queue::get_in(tx, &op.id)? {
        Some(current) if current.timestamp == op.timestamp => queue::mark_completed_in(tx, &op.id),
        Some(_) => {
            tracing::debug!("Operation {} changed while in flight; keeping it pending", op.id);
            Ok(())
        }
        None => Ok(()),
    }
}

fn repoint_entries_in(tx: &mut StoreTransaction<'_>, from: &str, to: &str) -> Result<()> {
    for mut entry in tx.get_by_index(HABIT_ENTRIES, "habitId", &Value::from(from))? {
        entry["habitId"] = Value::from(to);
        tx.put(HABIT_ENTRIES, &entry)?;
    }
    Ok(())
}

/// Confirmed delete: physically remove the record (and a habit's entries).
fn apply_removed_in(tx: &mut StoreTransaction<'_>, op: &SyncOperation) -> Result<OperationOutcome> {
    purge_entity_in(tx, op.entity_kind, &op.entity_id, Some(&op.id))?;
    queue::mark_completed_in(tx, &op.id)?;
    Ok(OperationOutcome::Synced)
}

/// Physically remove a record, a habit's entries, and every unfinished
/// operation on them except `keep_op`.
pub(crate) fn purge_entity_in(
    tx: &mut StoreTransaction<'_>,
    kind: EntityKind,
    entity_id: &str,
    keep_op: Option<&str>,
) -> Result<()> {
    tx.delete(kind.collection(), entity_id)?;
    if kind == EntityKind::Habit {
        for entry in tx.get_by_index(HABIT_ENTRIES, "habitId", &Value::from(entity_id))? {
            if let Some(id) = entry.get("id").and_then(Value::as_str) {
                tx.delete(HABIT_ENTRIES, id)?;
            }
        }
    }
    for pending in queue::for_entity_in(tx, entity_id)? {
        if Some(pending.id.as_str()) != keep_op && pending.status != OperationStatus::Completed {
            tx.delete(SYNC_QUEUE, &pending.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::default_schema;
    use crate::models::{Habit, HabitEntry, HabitRecord, Record};
    use crate::sync::clock::ManualClock;
    use crate::test_support::FakeRemote;
    use pretty_assertions::assert_eq;

    struct Fixture {
        store: Arc<Store>,
        queue: Arc<SyncQueue>,
        remote: Arc<FakeRemote>,
        processor: SyncProcessor,
    }

    async fn setup(config: SyncConfig) -> Fixture {
        let store = Arc::new(Store::open_in_memory(default_schema()).await.unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let queue = Arc::new(SyncQueue::new(store.clone(), clock.clone()));
        let conflicts = Arc::new(ConflictManager::new(store.clone(), queue.clone(), clock.clone()));
        let remote = Arc::new(FakeRemote::default());
        let processor = SyncProcessor::new(
            store.clone(),
            queue.clone(),
            conflicts,
            remote.clone(),
            clock,
            config,
        );
        Fixture {
            store,
            queue,
            remote,
            processor,
        }
    }

    async fn create_habit(fixture: &Fixture, name: &str) -> String {
        let record = Record::new_local(Habit::new(name), 1_000);
        let id = record.id().to_string();
        fixture.store.put(HABITS, &record.to_document().unwrap()).await.unwrap();
        fixture
            .queue
            .enqueue(
                SyncOperation::new(OperationType::Create, EntityKind::Habit, &id, record.payload().unwrap())
                    .with_entity_version(1),
            )
            .await
            .unwrap();
        id
    }

    async fn create_entry(fixture: &Fixture, habit_id: &str, day: &str) -> String {
        let entry = HabitEntry::completed(habit_id, HabitEntry::parse_date(day).unwrap());
        let record = Record::new_local(entry, 1_000);
        let id = record.id().to_string();
        fixture
            .store
            .put(HABIT_ENTRIES, &record.to_document().unwrap())
            .await
            .unwrap();
        fixture
            .queue
            .enqueue(
                SyncOperation::new(
                    OperationType::Create,
                    EntityKind::HabitEntry,
                    &id,
                    record.payload().unwrap(),
                )
                .with_parent(Some(habit_id.to_string()))
                .with_entity_version(1),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn create_rekeys_record_and_marks_synced() {
        let fixture = setup(SyncConfig::default()).await;
        let temp_id = create_habit(&fixture, "Exercise").await;

        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.successful, 1);

        assert_eq!(fixture.store.get(HABITS, &temp_id).await.unwrap(), None);
        let habits = fixture.store.get_all(HABITS).await.unwrap();
        let stored: HabitRecord = Record::from_document(habits[0].clone()).unwrap();
        assert!(stored.meta.synced);
        assert_eq!(stored.meta.temp_id, None);
        assert_eq!(stored.meta.server_id.as_deref(), Some(stored.id()));
        assert_eq!(fixture.queue.size().await.unwrap(), 0);
        assert!(fixture.processor.last_sync_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entry_created_before_habit_synced_follows_new_habit_id() {
        let fixture = setup(SyncConfig::default()).await;
        let habit_id = create_habit(&fixture, "Read").await;
        create_entry(&fixture, &habit_id, "2024-01-01").await;

        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.successful, 2);

        let habit = &fixture.store.get_all(HABITS).await.unwrap()[0];
        let entry = &fixture.store.get_all(HABIT_ENTRIES).await.unwrap()[0];
        assert_eq!(entry["habitId"], habit["id"]);
        assert_eq!(entry["synced"], json!(true));
        assert_eq!(fixture.remote.toggle_calls(), 1);
    }

    #[tokio::test]
    async fn network_failure_halts_later_chunks() {
        let fixture = setup(SyncConfig::default().with_batch_size(1)).await;
        create_habit(&fixture, "A").await;
        create_habit(&fixture, "B").await;
        create_habit(&fixture, "C").await;
        fixture.remote.fail_next(Error::NetworkFailure("connection refused".into()));

        let report = fixture.processor.process_pending().await.unwrap();
        assert!(report.halted);
        assert_eq!(report.failed, 1);
        assert_eq!(report.network_errors, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(fixture.remote.create_calls(), 1);

        let failed = fixture.queue.get_failed_operations().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert_eq!(failed[0].failure_class, Some(FailureClass::Network));
        assert!(fixture.processor.last_sync_at().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validation_failure_is_terminal_and_blocks_its_lane() {
        let fixture = setup(SyncConfig::default()).await;
        let habit_id = create_habit(&fixture, "Bad").await;
        create_entry(&fixture, &habit_id, "2024-01-01").await;
        fixture.remote.fail_next(Error::Remote {
            status: 422,
            message: "name is required".into(),
        });

        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert!(!report.halted);

        assert!(fixture
            .queue
            .get_ready()
            .await
            .unwrap()
            .iter()
            .all(|op| op.entity_kind == EntityKind::HabitEntry));
        let failed = fixture.queue.get_failed_operations().await.unwrap();
        assert!(failed[0].is_terminal_failure());
    }

    #[tokio::test]
    async fn entry_waits_while_its_habit_has_no_server_id() {
        let fixture = setup(SyncConfig::default()).await;
        let habit_id = create_habit(&fixture, "Bad").await;
        let entry_id = create_entry(&fixture, &habit_id, "2024-01-01").await;
        fixture.remote.fail_next(Error::Remote {
            status: 422,
            message: "name is required".into(),
        });
        fixture.processor.process_pending().await.unwrap();

        // The habit failed for good; the entry alone is ready but stays parked.
        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fixture.remote.toggle_calls(), 0);
        let waiting = fixture.queue.get_ready().await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].entity_id, entry_id);
        assert_eq!(waiting[0].status, OperationStatus::Pending);
        assert_eq!(waiting[0].retry_count, 0);
        assert!(fixture.processor.last_sync_at().await.unwrap().is_none());

        fixture.queue.retry_all_failed().await.unwrap();
        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.successful, 2);
        assert_eq!(fixture.remote.toggle_calls(), 1);
    }

    #[tokio::test]
    async fn delete_during_inflight_create_removes_server_copy() {
        let fixture = setup(SyncConfig::default()).await;
        let temp_id = create_habit(&fixture, "Brief").await;
        fixture.remote.hold();

        let (report, ()) = tokio::join!(fixture.processor.process_pending(), async {
            while fixture.remote.create_calls() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            fixture
                .store
                .transaction(
                    &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                    TransactionMode::ReadWrite,
                    move |tx| purge_entity_in(tx, EntityKind::Habit, &temp_id, None),
                )
                .await
                .unwrap();
            fixture.remote.release();
        });
        assert_eq!(report.unwrap().successful, 1);
        assert!(fixture.remote.record("habit_1").is_some());

        let queued = fixture.queue.get_ready().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].op_type, OperationType::Delete);
        assert_eq!(queued[0].entity_id, "habit_1");

        fixture.processor.process_pending().await.unwrap();
        assert_eq!(fixture.remote.delete_calls(), 1);
        assert!(fixture.remote.record("habit_1").is_none());
        assert_eq!(fixture.store.count(HABITS).await.unwrap(), 0);
        assert_eq!(fixture.queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_record_after_confirmation() {
        let fixture = setup(SyncConfig::default()).await;
        let temp_id = create_habit(&fixture, "Gone").await;
        fixture.processor.process_pending().await.unwrap();
        let server_id = fixture.store.get_all(HABITS).await.unwrap()[0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_ne!(server_id, temp_id);

        fixture
            .queue
            .enqueue(SyncOperation::new(
                OperationType::Delete,
                EntityKind::Habit,
                &server_id,
                json!({}),
            ))
            .await
            .unwrap();
        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.successful, 1);
        assert_eq!(fixture.store.count(HABITS).await.unwrap(), 0);
        assert_eq!(fixture.remote.delete_calls(), 1);
    }

    #[tokio::test]
    async fn diverged_server_version_records_conflict() {
        let fixture = setup(SyncConfig::default()).await;
        create_habit(&fixture, "Mine").await;
        fixture.processor.process_pending().await.unwrap();
        let doc = fixture.store.get_all(HABITS).await.unwrap()[0].clone();
        let mut record: HabitRecord = Record::from_document(doc).unwrap();
        record.data.name = "Mine, edited".into();
        record.meta.touch(2_000);
        fixture.store.put(HABITS, &record.to_document().unwrap()).await.unwrap();
        fixture
            .queue
            .enqueue(
                SyncOperation::new(
                    OperationType::Update,
                    EntityKind::Habit,
                    record.id(),
                    record.payload().unwrap(),
                )
                .with_entity_version(record.meta.version),
            )
            .await
            .unwrap();
        fixture.remote.diverge(record.id(), json!({ "name": "Theirs" }), 5);

        let report = fixture.processor.process_pending().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.failed, 0);

        let stored: HabitRecord =
            Record::from_document(fixture.store.get(HABITS, record.id()).await.unwrap().unwrap())
                .unwrap();
        assert_eq!(stored.data.name, "Mine, edited");
        assert!(!stored.meta.synced);
    }

    #[test]
    fn lanes_group_entries_behind_their_habit() {
        let ops = vec![
            SyncOperation::new(OperationType::Create, EntityKind::Habit, "h1", json!({})),
            SyncOperation::new(OperationType::Create, EntityKind::Habit, "h2", json!({})),
            SyncOperation::new(OperationType::Create, EntityKind::HabitEntry, "e1", json!({}))
                .with_parent(Some("h1".into())),
        ];
        let lanes = into_lanes(&ops);
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[0].key, "h1");
        assert_eq!(lanes[0].ops.len(), 2);
    }
}
