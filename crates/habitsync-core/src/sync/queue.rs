//! Durable outbox of pending remote mutations

use std::sync::{Arc, Mutex, PoisonError};

use crate::db::schema::SYNC_QUEUE;
use crate::db::{Store, StoreTransaction, TransactionMode};
use crate::error::{classify_message, Error, FailureClass, Result};
use crate::models::{OperationStatus, OperationType, SyncOperation};
use crate::sync::clock::Clock;
use crate::util::new_id;

/// Outbox persisted in the `syncQueue` collection.
///
/// Every method has a `_in` twin taking an open [`StoreTransaction`] so a
/// record write and its queue entry commit together. Clones share the same
/// timestamp sequence.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    last_timestamp: Arc<Mutex<Option<i64>>>,
}

impl SyncQueue {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_retries: crate::models::DEFAULT_MAX_RETRIES,
            last_timestamp: Arc::new(Mutex::new(None)),
        }
    }

    /// Retry budget given to newly enqueued operations.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub const fn store(&self) -> &Arc<Store> {
        &self.store
    }

    async fn write<T, F>(&self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T> + Send + 'static,
    {
        self.store
            .transaction(&[SYNC_QUEUE], TransactionMode::ReadWrite, body)
            .await
    }

    async fn read_all(&self) -> Result<Vec<SyncOperation>> {
        self.store
            .transaction(&[SYNC_QUEUE], TransactionMode::ReadOnly, |tx| all_in(tx))
            .await
    }

    /// Next timestamp, strictly greater than any handed out before.
    fn next_timestamp(&self, tx: &StoreTransaction<'_>) -> Result<i64> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let floor = match *last {
            Some(value) => value,
            // Seed from what is already persisted so a restart stays ordered.
            None => all_in(tx)?
                .iter()
                .map(|op| op.timestamp)
                .max()
                .unwrap_or(i64::MIN),
        };
        let timestamp = self.clock.now_millis().max(floor.saturating_add(1));
        *last = Some(timestamp);
        Ok(timestamp)
    }

    /// Append an operation, or fold an UPDATE into an outstanding one.
    pub async fn enqueue(&self, op: SyncOperation) -> Result<String> {
        let queue = self.clone();
        self.write(move |tx| queue.enqueue_in(tx, op)).await
    }

    /// Transaction-scoped [`SyncQueue::enqueue`].
    ///
    /// An UPDATE for an entity that already has a PENDING UPDATE replaces that
    /// operation's payload in place (same id, refreshed timestamp). CREATE and
    /// DELETE are always appended.
    pub fn enqueue_in(&self, tx: &mut StoreTransaction<'_>, mut op: SyncOperation) -> Result<String> {
        if op.op_type == OperationType::Update {
            let outstanding = for_entity_in(tx, &op.entity_id)?.into_iter().find(|existing| {
                existing.op_type == OperationType::Update
                    && existing.status == OperationStatus::Pending
                    && existing.entity_kind == op.entity_kind
            });
            if let Some(mut existing) = outstanding {
                existing.payload = op.payload;
                existing.entity_version = op.entity_version;
                existing.parent_id = op.parent_id.or(existing.parent_id);
                existing.timestamp = self.next_timestamp(tx)?;
                tracing::debug!(
                    "Merged UPDATE for {} {} into operation {}",
                    existing.entity_kind,
                    existing.entity_id,
                    existing.id
                );
                return put_op(tx, &existing);
            }
        }

        op.id = new_id();
        op.timestamp = self.next_timestamp(tx)?;
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.last_error = None;
        op.failure_class = None;
        op.max_retries = self.max_retries;
        tracing::debug!(
            "Enqueued {:?} for {} {} as {}",
            op.op_type,
            op.entity_kind,
            op.entity_id,
            op.id
        );
        put_op(tx, &op)
    }

    /// Every operation, ascending by timestamp.
    pub async fn get_all(&self) -> Result<Vec<SyncOperation>> {
        self.read_all().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SyncOperation>> {
        let id = id.to_string();
        self.store
            .transaction(&[SYNC_QUEUE], TransactionMode::ReadOnly, move |tx| {
                get_in(tx, &id)
            })
            .await
    }

    pub async fn get_pending(&self) -> Result<Vec<SyncOperation>> {
        self.with_status(OperationStatus::Pending).await
    }

    pub async fn get_failed_operations(&self) -> Result<Vec<SyncOperation>> {
        self.with_status(OperationStatus::Failed).await
    }

    async fn with_status(&self, status: OperationStatus) -> Result<Vec<SyncOperation>> {
        self.store
            .transaction(&[SYNC_QUEUE], TransactionMode::ReadOnly, move |tx| {
                let mut ops = decode_all(tx.get_by_index(
                    SYNC_QUEUE,
                    "status",
                    &serde_json::Value::from(status.as_str()),
                )?)?;
                sort_ops(&mut ops);
                Ok(ops)
            })
            .await
    }

    /// Operations the processor should pick up, in submission order.
    pub async fn get_ready(&self) -> Result<Vec<SyncOperation>> {
        let mut ops = self.read_all().await?;
        ops.retain(SyncOperation::is_ready);
        Ok(ops)
    }

    /// Operations for one entity (as subject or as parent), in order.
    pub async fn get_for_entity(&self, entity_id: &str) -> Result<Vec<SyncOperation>> {
        let entity_id = entity_id.to_string();
        self.store
            .transaction(&[SYNC_QUEUE], TransactionMode::ReadOnly, move |tx| {
                for_entity_in(tx, &entity_id)
            })
            .await
    }

    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.write(move |tx| mark_completed_in(tx, &id)).await
    }

    /// Record a failure; the class is inferred from the message.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<SyncOperation> {
        self.mark_failed_with_class(id, reason, classify_message(reason))
            .await
    }

    /// Record a failure: bumps `retry_count` and sets status FAILED.
    pub async fn mark_failed_with_class(
        &self,
        id: &str,
        reason: &str,
        class: FailureClass,
    ) -> Result<SyncOperation> {
        let (id, reason) = (id.to_string(), reason.to_string());
        self.write(move |tx| mark_failed_in(tx, &id, &reason, class))
            .await
    }

    /// Put a failed operation back to PENDING without resetting its retry count.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.write(move |tx| {
            let mut op = require_in(tx, &id)?;
            op.status = OperationStatus::Pending;
            op.failure_class = None;
            put_op(tx, &op).map(drop)
        })
        .await
    }

    /// Retry every failed operation. Returns how many were reset.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        self.write(|tx| {
            let failed: Vec<SyncOperation> = all_in(tx)?
                .into_iter()
                .filter(|op| op.status == OperationStatus::Failed)
                .collect();
            for mut op in failed.iter().cloned() {
                op.status = OperationStatus::Pending;
                op.failure_class = None;
                put_op(tx, &op)?;
            }
            Ok(failed.len())
        })
        .await
    }

    /// Operations not yet completed (pending or failed).
    pub async fn size(&self) -> Result<usize> {
        Ok(self
            .read_all()
            .await?
            .iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .count())
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.write(move |tx| tx.delete(SYNC_QUEUE, &id)).await
    }

    /// Drop completed operations. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize> {
        self.write(|tx| {
            let completed: Vec<String> = all_in(tx)?
                .into_iter()
                .filter(|op| op.status == OperationStatus::Completed)
                .map(|op| op.id)
                .collect();
            for id in &completed {
                tx.delete(SYNC_QUEUE, id)?;
            }
            Ok(completed.len())
        })
        .await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.write(|tx| tx.clear(SYNC_QUEUE)).await
    }
}

fn put_op(tx: &mut StoreTransaction<'_>, op: &SyncOperation) -> Result<String> {
    tx.put(SYNC_QUEUE, &serde_json::to_value(op)?)
}

fn decode_all(documents: Vec<serde_json::Value>) -> Result<Vec<SyncOperation>> {
    documents
        .into_iter()
        .map(|document| Ok(serde_json::from_value(document)?))
        .collect()
}

fn sort_ops(ops: &mut [SyncOperation]) {
    ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// All queued operations inside an open transaction, ascending by timestamp.
pub fn all_in(tx: &StoreTransaction<'_>) -> Result<Vec<SyncOperation>> {
    let mut ops = decode_all(tx.get_all(SYNC_QUEUE)?)?;
    sort_ops(&mut ops);
    Ok(ops)
}

pub fn get_in(tx: &StoreTransaction<'_>, id: &str) -> Result<Option<SyncOperation>> {
    tx.get(SYNC_QUEUE, id)?
        .map(|document| Ok(serde_json::from_value(document)?))
        .transpose()
}

fn require_in(tx: &StoreTransaction<'_>, id: &str) -> Result<SyncOperation> {
    get_in(tx, id)?.ok_or_else(|| Error::NotFound(format!("sync operation {id}")))
}

/// Operations whose subject or parent is `entity_id`.
pub fn for_entity_in(tx: &StoreTransaction<'_>, entity_id: &str) -> Result<Vec<SyncOperation>> {
    let key = serde_json::Value::from(entity_id);
    let mut ops = decode_all(tx.get_by_index(SYNC_QUEUE, "entityId", &key)?)?;
    ops.extend(decode_all(tx.get_by_index(SYNC_QUEUE, "parentId", &key)?)?);
    sort_ops(&mut ops);
    ops.dedup_by(|a, b| a.id == b.id);
    Ok(ops)
}

pub fn mark_completed_in(tx: &mut StoreTransaction<'_>, id: &str) -> Result<()> {
    let mut op = require_in(tx, id)?;
    op.status = OperationStatus::Completed;
    op.last_error = None;
    op.failure_class = None;
    put_op(tx, &op).map(drop)
}

pub fn mark_failed_in(
    tx: &mut StoreTransaction<'_>,
    id: &str,
    reason: &str,
    class: FailureClass,
) -> Result<SyncOperation> {
    let mut op = require_in(tx, id)?;
    op.retry_count += 1;
    op.status = OperationStatus::Failed;
    op.last_error = Some(reason.to_string());
    op.failure_class = Some(class);
    put_op(tx, &op)?;
    Ok(op)
}

/// Point outstanding operations at a new entity id.
///
/// Rewrites both `entityId == from` and `parentId == from`, so entry
/// operations follow their habit when it receives a server id.
pub fn rekey_entity_in(tx: &mut StoreTransaction<'_>, from: &str, to: &str) -> Result<usize> {
    let mut changed = 0;
    for mut op in for_entity_in(tx, from)? {
        if op.status == OperationStatus::Completed {
            continue;
        }
        if op.entity_id == from {
            op.entity_id = to.to_string();
        }
        if op.parent_id.as_deref() == Some(from) {
            op.parent_id = Some(to.to_string());
        }
        put_op(tx, &op)?;
        changed += 1;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::default_schema;
    use crate::models::EntityKind;
    use crate::sync::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> (SyncQueue, Arc<ManualClock>) {
        let store = Arc::new(Store::open_in_memory(default_schema()).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        (SyncQueue::new(store, clock.clone()), clock)
    }

    fn update(entity: &str, name: &str) -> SyncOperation {
        SyncOperation::new(OperationType::Update, EntityKind::Habit, entity, json!({ "name": name }))
    }

    #[tokio::test]
    async fn enqueue_assigns_id_timestamp_and_pending_status() {
        let (queue, _) = setup().await;
        let id = queue
            .enqueue(SyncOperation::new(
                OperationType::Create,
                EntityKind::Habit,
                "temp_1",
                json!({ "name": "Exercise" }),
            ))
            .await
            .unwrap();
        let op = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.timestamp, 1_000);
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing_within_one_millisecond() {
        let (queue, _) = setup().await;
        for entity in ["a", "b", "c"] {
            queue.enqueue(update(entity, "x")).await.unwrap();
        }
        let stamps: Vec<i64> = queue
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|op| op.timestamp)
            .collect();
        assert_eq!(stamps, vec![1_000, 1_001, 1_002]);
    }

    #[tokio::test]
    async fn consecutive_updates_merge_into_one_operation() {
        let (queue, clock) = setup().await;
        let first = queue.enqueue(update("h1", "A")).await.unwrap();
        clock.advance(std::time::Duration::from_millis(10));
        let second = queue.enqueue(update("h1", "B")).await.unwrap();
        let third = queue.enqueue(update("h1", "C")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
        let ops = queue.get_all().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].payload, json!({ "name": "C" }));
        assert!(ops[0].timestamp > 1_000);
    }

    #[tokio::test]
    async fn create_and_delete_are_never_merged() {
        let (queue, _) = setup().await;
        queue
            .enqueue(SyncOperation::new(OperationType::Create, EntityKind::Habit, "h1", json!({})))
            .await
            .unwrap();
        queue.enqueue(update("h1", "A")).await.unwrap();
        queue
            .enqueue(SyncOperation::new(OperationType::Delete, EntityKind::Habit, "h1", json!({})))
            .await
            .unwrap();
        let types: Vec<OperationType> = queue
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|op| op.op_type)
            .collect();
        assert_eq!(
            types,
            vec![OperationType::Create, OperationType::Update, OperationType::Delete]
        );
    }

    #[tokio::test]
    async fn update_after_failed_update_is_appended() {
        let (queue, _) = setup().await;
        let first = queue.enqueue(update("h1", "A")).await.unwrap();
        queue.mark_failed(&first, "request timed out").await.unwrap();
        let second = queue.enqueue(update("h1", "B")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mark_failed_and_retry_keep_retry_count() {
        let (queue, _) = setup().await;
        let id = queue.enqueue(update("h1", "A")).await.unwrap();

        let failed = queue.mark_failed(&id, "connection refused").await.unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.failure_class, Some(FailureClass::Network));
        assert_eq!(queue.get_failed_operations().await.unwrap().len(), 1);

        queue.retry(&id).await.unwrap();
        let op = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);
    }

    #[tokio::test]
    async fn terminal_failures_are_not_ready() {
        let (queue, _) = setup().await;
        let bad = queue.enqueue(update("h1", "A")).await.unwrap();
        let flaky = queue.enqueue(update("h2", "B")).await.unwrap();
        queue
            .mark_failed_with_class(&bad, "name is required", FailureClass::Validation)
            .await
            .unwrap();
        queue.mark_failed(&flaky, "timeout").await.unwrap();

        let ready: Vec<String> = queue
            .get_ready()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ready, vec![flaky]);
    }

    #[tokio::test]
    async fn missing_operation_is_not_found() {
        let (queue, _) = setup().await;
        assert!(matches!(
            queue.mark_completed("nope").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clear_completed_removes_only_completed() {
        let (queue, _) = setup().await;
        let done = queue.enqueue(update("h1", "A")).await.unwrap();
        queue.enqueue(update("h2", "B")).await.unwrap();
        queue.mark_completed(&done).await.unwrap();

        assert_eq!(queue.clear_completed().await.unwrap(), 1);
        assert_eq!(queue.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rekey_moves_entity_and_child_operations() {
        let (queue, _) = setup().await;
        queue.enqueue(update("temp_h", "A")).await.unwrap();
        queue
            .enqueue(
                SyncOperation::new(OperationType::Create, EntityKind::HabitEntry, "e1", json!({}))
                    .with_parent(Some("temp_h".to_string())),
            )
            .await
            .unwrap();

        let changed = queue
            .write(|tx| rekey_entity_in(tx, "temp_h", "srv_h"))
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let ops = queue.get_all().await.unwrap();
        assert_eq!(ops[0].entity_id, "srv_h");
        assert_eq!(ops[1].parent_id.as_deref(), Some("srv_h"));
        assert!(queue.get_for_entity("temp_h").await.unwrap().is_empty());
    }
}
