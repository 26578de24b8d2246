//! Conflict detection and resolution

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::db::schema::{CONFLICTS, SYNC_QUEUE};
use crate::db::{Store, StoreTransaction, TransactionMode};
use crate::error::{Error, Result};
use crate::models::{
    domain_fields, AutoResolvePolicy, ConflictRecord, EntityKind, Habit, HabitEntry,
    OperationStatus, OperationType, RemoteRecord, Resolution, SyncEntity, SyncMeta, SyncOperation,
};
use crate::sync::clock::Clock;
use crate::sync::queue::{self, SyncQueue};
use crate::util::new_id;

/// Combines local and server domain fields for [`Resolution::Merge`].
pub trait ConflictMerger: Send + Sync {
    fn merge(&self, local: &Value, server: &Value) -> Result<Value>;
}

/// Side whose fields win when both define them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeSide {
    #[default]
    Local,
    Server,
}

/// Field-level overlay: start from the losing side, overwrite with the winner.
///
/// Fields only one side knows about are kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayMerger {
    pub winner: MergeSide,
}

impl OverlayMerger {
    pub const fn new(winner: MergeSide) -> Self {
        Self { winner }
    }
}

impl ConflictMerger for OverlayMerger {
    fn merge(&self, local: &Value, server: &Value) -> Result<Value> {
        let (base, overlay) = match self.winner {
            MergeSide::Local => (server, local),
            MergeSide::Server => (local, server),
        };
        match (base, overlay) {
            (Value::Object(base), Value::Object(overlay)) => {
                let mut merged = base.clone();
                for (key, value) in overlay {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(merged))
            }
            _ => Ok(overlay.clone()),
        }
    }
}

/// Owns the `conflicts` collection.
#[derive(Clone)]
pub struct ConflictManager {
    store: Arc<Store>,
    queue: Arc<SyncQueue>,
    clock: Arc<dyn Clock>,
    merger: Arc<dyn ConflictMerger>,
}

impl ConflictManager {
    pub fn new(store: Arc<Store>, queue: Arc<SyncQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
            merger: Arc::new(OverlayMerger::default()),
        }
    }

    #[must_use]
    pub fn with_merger(mut self, merger: Arc<dyn ConflictMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Whether applying `remote` over `local` would silently drop a local edit.
    ///
    /// True when the local record has unsynced changes, the client knows which
    /// server version it last saw, the server has moved on by more than our
    /// own write, and the data actually differs.
    pub fn detect_conflict(local: &Value, remote: &RemoteRecord) -> bool {
        let Ok(meta) = serde_json::from_value::<SyncMeta>(local.clone()) else {
            return false;
        };
        if meta.synced {
            return false;
        }
        let Some(known) = meta.server_version else {
            return false;
        };
        remote.version != known + 1 && !same_domain_data(&domain_fields(local), &remote.data)
    }

    /// Persist a conflict inside the caller's transaction.
    ///
    /// An entity has at most one unresolved conflict; a newer detection
    /// replaces the server side of the existing one.
    pub fn record_conflict_in(
        &self,
        tx: &mut StoreTransaction<'_>,
        kind: EntityKind,
        entity_id: &str,
        local: &Value,
        remote: &RemoteRecord,
    ) -> Result<ConflictRecord> {
        let existing = unresolved_for_entity_in(tx, entity_id)?.into_iter().next();
        let conflict = ConflictRecord {
            id: existing.map_or_else(new_id, |conflict| conflict.id),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            local_data: local.clone(),
            server_data: remote.clone(),
            timestamp: self.clock.now_millis(),
            resolved: false,
        };
        tx.put(CONFLICTS, &serde_json::to_value(&conflict)?)?;
        tracing::warn!(
            "Conflict detected on {} {} (server version {})",
            kind,
            entity_id,
            remote.version
        );
        Ok(conflict)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>> {
        let id = id.to_string();
        self.store
            .transaction(&[CONFLICTS], TransactionMode::ReadOnly, move |tx| {
                get_in(tx, &id)
            })
            .await
    }

    /// Unresolved conflicts, oldest first.
    pub async fn get_unresolved(&self) -> Result<Vec<ConflictRecord>> {
        self.store
            .transaction(&[CONFLICTS], TransactionMode::ReadOnly, |tx| {
                let mut conflicts = decode_all(tx.get_by_index(
                    CONFLICTS,
                    "resolved",
                    &Value::Bool(false),
                )?)?;
                conflicts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
                Ok(conflicts)
            })
            .await
    }

    pub async fn get_for_entity(&self, entity_id: &str) -> Result<Vec<ConflictRecord>> {
        let entity_id = entity_id.to_string();
        self.store
            .transaction(&[CONFLICTS], TransactionMode::ReadOnly, move |tx| {
                unresolved_for_entity_in(tx, &entity_id)
            })
            .await
    }

    pub async fn count_unresolved(&self) -> Result<usize> {
        Ok(self.get_unresolved().await?.len())
    }

    /// Apply one resolution atomically.
    ///
    /// Deletes the conflict, writes the resolved record and enqueues exactly
    /// one UPDATE carrying the resolved value. Returns that operation id.
    ///
    /// Adopting the server side discards queued local edits first, so the
    /// follow-up UPDATE only echoes the server payload back at the version the
    /// server reported.
    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> Result<String> {
        let conflict = self
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        let collection = conflict.entity_kind.collection();
        let now = self.clock.now_millis();
        let name = resolution.name();

        let manager = self.clone();
        let resolved = conflict.clone();
        let op_id = self
            .store
            .transaction(
                &[collection, CONFLICTS, SYNC_QUEUE],
                TransactionMode::ReadWrite,
                move |tx| {
                    // Re-read inside the transaction so a concurrent resolve loses cleanly.
                    if get_in(tx, &resolved.id)?.is_none() {
                        return Err(Error::NotFound(format!("conflict {}", resolved.id)));
                    }
                    let local = tx.get(collection, &resolved.entity_id)?.ok_or_else(|| {
                        Error::NotFound(format!("{} {}", resolved.entity_kind, resolved.entity_id))
                    })?;
                    let op_id = manager.apply_resolution_in(tx, &resolved, &local, &resolution, now)?;
                    tx.delete(CONFLICTS, &resolved.id)?;
                    Ok(op_id)
                },
            )
            .await?;

        tracing::info!(
            "Resolved conflict on {} {} with {name}",
            conflict.entity_kind,
            conflict.entity_id
        );
        Ok(op_id)
    }

    fn apply_resolution_in(
        &self,
        tx: &mut StoreTransaction<'_>,
        conflict: &ConflictRecord,
        local: &Value,
        resolution: &Resolution,
        now: i64,
    ) -> Result<String> {
        let kind = conflict.entity_kind;
        let server = &conflict.server_data;
        let mut meta: SyncMeta = serde_json::from_value(local.clone())?;
        let local_data = domain_fields(local);

        let data = match resolution {
            Resolution::UseServer => {
                drop_pending_updates_in(tx, &conflict.entity_id)?;
                server.data.clone()
            }
            Resolution::UseLocal => local_data,
            Resolution::Merge => self.merger.merge(&local_data, &server.data)?,
            Resolution::Merged(value) => value.clone(),
        };

        let data = normalize_domain(kind, &data)?;
        meta.touch(now);
        meta.server_id = Some(server.server_id.clone());
        meta.server_version = Some(server.version);
        tx.put(kind.collection(), &compose(&meta, &data)?)?;

        let parent_id = data
            .get("habitId")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let op = SyncOperation::new(OperationType::Update, kind, meta.id.clone(), data)
            .with_parent(parent_id)
            .with_entity_version(meta.version);
        self.queue.enqueue_in(tx, op)
    }

    /// Resolve every unresolved conflict with an automatic policy.
    ///
    /// Returns the number resolved; `Manual` leaves everything untouched.
    pub async fn resolve_all(&self, policy: AutoResolvePolicy) -> Result<usize> {
        if policy == AutoResolvePolicy::Manual {
            return Ok(0);
        }
        let mut resolved = 0;
        for conflict in self.get_unresolved().await? {
            let resolution = auto_resolution(policy, &conflict);
            match self.resolve_conflict(&conflict.id, resolution).await {
                Ok(_) => resolved += 1,
                Err(Error::NotFound(message)) => {
                    tracing::debug!("Skipping conflict {}: {message}", conflict.id);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(resolved)
    }
}

/// Resolution an automatic policy picks for one conflict.
pub fn auto_resolution(policy: AutoResolvePolicy, conflict: &ConflictRecord) -> Resolution {
    match policy {
        AutoResolvePolicy::ServerWins | AutoResolvePolicy::Manual => Resolution::UseServer,
        AutoResolvePolicy::LocalWins => Resolution::UseLocal,
        AutoResolvePolicy::LastWriteWins => {
            let local_modified = conflict
                .local_data
                .get("lastModified")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            if local_modified > conflict.server_data.last_modified {
                Resolution::UseLocal
            } else {
                Resolution::UseServer
            }
        }
    }
}

fn get_in(tx: &StoreTransaction<'_>, id: &str) -> Result<Option<ConflictRecord>> {
    tx.get(CONFLICTS, id)?
        .map(|document| Ok(serde_json::from_value(document)?))
        .transpose()
}

fn decode_all(documents: Vec<Value>) -> Result<Vec<ConflictRecord>> {
    documents
        .into_iter()
        .map(|document| Ok(serde_json::from_value(document)?))
        .collect()
}

fn unresolved_for_entity_in(tx: &StoreTransaction<'_>, entity_id: &str) -> Result<Vec<ConflictRecord>> {
    let mut conflicts =
        decode_all(tx.get_by_index(CONFLICTS, "entityId", &Value::from(entity_id))?)?;
    conflicts.retain(|conflict| !conflict.resolved);
    conflicts.sort_by_key(|conflict| conflict.timestamp);
    Ok(conflicts)
}

/// Remove unsent UPDATEs for the entity.
fn drop_pending_updates_in(tx: &mut StoreTransaction<'_>, entity_id: &str) -> Result<()> {
    for op in queue::for_entity_in(tx, entity_id)? {
        if op.entity_id == entity_id
            && op.op_type == OperationType::Update
            && op.status != OperationStatus::Completed
        {
            tx.delete(SYNC_QUEUE, &op.id)?;
        }
    }
    Ok(())
}

/// Check domain fields against the entity's rules and return them normalized.
pub(crate) fn normalize_domain(kind: EntityKind, data: &Value) -> Result<Value> {
    fn normalized<T: SyncEntity>(data: &Value) -> Result<Value> {
        let mut entity: T = serde_json::from_value(data.clone())
            .map_err(|error| Error::ValidationFailed(format!("invalid {}: {error}", T::KIND)))?;
        entity.validate()?;
        Ok(serde_json::to_value(entity)?)
    }
    match kind {
        EntityKind::Habit => normalized::<Habit>(data),
        EntityKind::HabitEntry => normalized::<HabitEntry>(data),
    }
}

/// Stored document from metadata plus domain fields.
pub(crate) fn compose(meta: &SyncMeta, data: &Value) -> Result<Value> {
    let mut document = match serde_json::to_value(meta)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Value::Object(fields) = data {
        for (key, value) in fields {
            document.insert(key.clone(), value.clone());
        }
    }
    Ok(Value::Object(document))
}

/// Compare domain objects, treating a missing field like `null`.
fn same_domain_data(local: &Value, server: &Value) -> bool {
    match (local, server) {
        (Value::Object(local), Value::Object(server)) => local
            .keys()
            .chain(server.keys())
            .all(|key| local.get(key).unwrap_or(&Value::Null) == server.get(key).unwrap_or(&Value::Null)),
        _ => local == server,
    }
}
