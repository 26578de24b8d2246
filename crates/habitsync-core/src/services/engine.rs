//! Composition of the local store, outbox, scheduler and maintenance tools
//! behind one client-facing service.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityStatus, HttpSensor, NetworkSensor, QualitySample};
use crate::db::schema::{HABITS, HABIT_ENTRIES, METADATA, SYNC_QUEUE};
use crate::db::{
    builtin_migrations, default_schema, Backup, BackupInfo, BackupManager, IntegrityChecker,
    IntegrityOptions, IntegrityReport, Migration, MigrationStatus, Migrator, RecoveryReport, Store,
    StoreTransaction, TransactionMode,
};
use crate::error::{Error, Result};
use crate::models::{
    AutoResolvePolicy, ConflictRecord, EntityKind, EntryUpdate, Habit, HabitEntry,
    HabitEntryRecord, HabitRecord, HabitUpdate, OperationStatus, OperationType, Record,
    Resolution, SyncEntity, SyncOperation,
};
use crate::state::SyncStatus;
use crate::sync::processor::purge_entity_in;
use crate::util::is_temp_id;
use crate::sync::queue;
use crate::sync::{
    BatchReport, Clock, ConflictManager, HttpRemoteApi, RemoteApi, SchedulerStatus, SyncEvent,
    SyncProcessor, SyncQueue, SyncScheduler, SystemClock, LAST_SYNC_KEY,
};

/// Wires an [`HabitSyncEngine`] from configuration plus optional overrides.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<Store>>,
    remote: Option<Arc<dyn RemoteApi>>,
    sensor: Option<Arc<dyn NetworkSensor>>,
    clock: Option<Arc<dyn Clock>>,
    migrations: Option<Vec<Migration>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            remote: None,
            sensor: None,
            clock: None,
            migrations: None,
        }
    }

    /// Use an already opened store instead of `config.db_path`.
    #[must_use]
    pub fn store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this remote instead of building one from `config.api_url`.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    #[must_use]
    pub fn sensor(mut self, sensor: Arc<dyn NetworkSensor>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the built-in migrations.
    #[must_use]
    pub fn migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Open the store, bring its schema up to date and assemble the engine.
    pub async fn open(self) -> Result<HabitSyncEngine> {
        let config = self.config;
        config.validate()?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let store = match (self.store, &config.db_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(Store::open(path, default_schema()).await?),
            (None, None) => {
                tracing::info!("No database path configured; using an in-memory store");
                Arc::new(Store::open_in_memory(default_schema()).await?)
            }
        };

        let backups = config
            .resolved_backup_dir()
            .map(|dir| Arc::new(BackupManager::new(dir, clock.clone())));
        let mut migrator = Migrator::new(
            store.clone(),
            self.migrations.unwrap_or_else(builtin_migrations),
        )?;
        if let Some(backups) = &backups {
            migrator = migrator.with_backups(backups.clone());
        }
        let applied = migrator.migrate().await?;
        if !applied.is_empty() {
            if let Some(backups) = &backups {
                backups.prune(config.integrity.keep_backups)?;
            }
        }

        let queue = Arc::new(
            SyncQueue::new(store.clone(), clock.clone())
                .with_max_retries(config.sync.operation_max_retries),
        );
        let conflicts = Arc::new(ConflictManager::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
        ));

        let remote: Option<Arc<dyn RemoteApi>> = match (self.remote, &config.api_url) {
            (Some(remote), _) => Some(remote),
            (None, Some(url)) => Some(Arc::new(HttpRemoteApi::with_timeout(
                url.clone(),
                config.api_token.clone(),
                config.sync.request_timeout(),
            )?)),
            (None, None) => {
                tracing::info!("Running in local-only mode (no remote configured)");
                None
            }
        };
        let scheduler = remote.map(|remote| {
            let processor = Arc::new(SyncProcessor::new(
                store.clone(),
                queue.clone(),
                conflicts.clone(),
                remote,
                clock.clone(),
                config.sync.clone(),
            ));
            SyncScheduler::new(
                processor,
                conflicts.clone(),
                clock.clone(),
                config.scheduler.clone(),
                config.conflicts.auto_resolve,
            )
        });

        let reachability_url = config.resolved_reachability_url();
        let sensor: Option<Arc<dyn NetworkSensor>> = match (self.sensor, reachability_url) {
            (Some(sensor), _) => Some(sensor),
            (None, Some(url)) => Some(Arc::new(HttpSensor::new(
                url,
                config.connectivity.reachability_timeout(),
            )?)),
            (None, None) => None,
        };
        let connectivity = sensor.map(|sensor| {
            ConnectivityMonitor::new(sensor, clock.clone(), config.connectivity.clone())
        });

        let mut integrity = IntegrityChecker::new(store.clone(), queue.clone(), clock.clone());
        if let Some(backups) = &backups {
            integrity = integrity.with_backups(backups.clone());
        }

        Ok(HabitSyncEngine {
            config,
            store,
            clock,
            queue,
            conflicts,
            scheduler,
            connectivity,
            backups,
            integrity,
            migrator,
        })
    }
}

/// Local-first habit tracking with background sync.
///
/// Every mutation commits the record and its outbox operation in one store
/// transaction before returning; the network is only touched by sync passes.
pub struct HabitSyncEngine {
    config: EngineConfig,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictManager>,
    scheduler: Option<Arc<SyncScheduler>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    backups: Option<Arc<BackupManager>>,
    integrity: IntegrityChecker,
    migrator: Migrator,
}

impl HabitSyncEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub const fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Start background work: connectivity checks, periodic sync and reconnect triggers.
    pub fn start(&self) {
        if let Some(monitor) = &self.connectivity {
            monitor.start();
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.start(self.connectivity.as_ref().map(|monitor| monitor.subscribe()));
        }
        tracing::info!("Sync engine started");
    }

    /// Stop background work. A sync pass already running completes on its own.
    pub fn stop(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        if let Some(monitor) = &self.connectivity {
            monitor.stop();
        }
    }

    pub async fn close(&self) {
        self.stop();
        self.store.close().await;
    }

    // Habits

    pub async fn create_habit(&self, mut habit: Habit) -> Result<HabitRecord> {
        habit.validate()?;
        let record = Record::new_local(habit, self.clock.now_millis());
        let queue = self.queue.clone();
        let record = self
            .store
            .transaction(&[HABITS, SYNC_QUEUE], TransactionMode::ReadWrite, move |tx| {
                ensure_unique_name_in(tx, &record.data.domain_key(), None)?;
                tx.put(HABITS, &record.to_document()?)?;
                queue.enqueue_in(
                    tx,
                    SyncOperation::new(
                        OperationType::Create,
                        EntityKind::Habit,
                        record.id(),
                        record.payload()?,
                    )
                    .with_entity_version(record.meta.version),
                )?;
                Ok(record)
            })
            .await?;
        tracing::debug!("Created habit {}", record.id());
        Ok(record)
    }

    pub async fn update_habit(&self, id: &str, update: HabitUpdate) -> Result<HabitRecord> {
        let now = self.clock.now_millis();
        let queue = self.queue.clone();
        let id = id.to_string();
        self.store
            .transaction(&[HABITS, SYNC_QUEUE], TransactionMode::ReadWrite, move |tx| {
                let mut record: HabitRecord = load_active_in(tx, &id)?;
                if update.is_empty() {
                    return Ok(record);
                }
                update.apply(&mut record.data);
                record.data.validate()?;
                ensure_unique_name_in(tx, &record.data.domain_key(), Some(&id))?;
                record.meta.touch(now);
                tx.put(HABITS, &record.to_document()?)?;
                queue.enqueue_in(
                    tx,
                    SyncOperation::new(
                        OperationType::Update,
                        EntityKind::Habit,
                        &id,
                        record.payload()?,
                    )
                    .with_entity_version(record.meta.version),
                )?;
                Ok(record)
            })
            .await
    }

    /// Delete a habit and, with it, its entries.
    ///
    /// A habit the server never saw is removed outright together with its
    /// queued operations; otherwise it is soft-deleted and a DELETE is queued.
    pub async fn delete_habit(&self, id: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let queue = self.queue.clone();
        let owned = id.to_string();
        self.store
            .transaction(
                &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                TransactionMode::ReadWrite,
                move |tx| {
                    let record: HabitRecord = load_active_in(tx, &owned)?;
                    retire_in(&queue, tx, record, now)
                },
            )
            .await?;
        tracing::debug!("Deleted habit {id}");
        Ok(())
    }

    pub async fn get_habit(&self, id: &str) -> Result<HabitRecord> {
        let id = id.to_string();
        self.store
            .transaction(&[HABITS], TransactionMode::ReadOnly, move |tx| {
                load_active_in(tx, &id)
            })
            .await
    }

    /// Active habits ordered by name.
    pub async fn list_habits(&self, include_archived: bool) -> Result<Vec<HabitRecord>> {
        let mut habits: Vec<HabitRecord> = decode_active(self.store.get_all(HABITS).await?)?
            .into_iter()
            .filter(|record: &HabitRecord| include_archived || !record.data.archived)
            .collect();
        habits.sort_by(|a, b| {
            a.data
                .domain_key()
                .cmp(&b.data.domain_key())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(habits)
    }

    // Entries

    /// Mark `date` completed or not for a habit, creating the entry if needed.
    pub async fn set_completion(
        &self,
        habit_id: &str,
        date: NaiveDate,
        completed: bool,
        note: Option<String>,
    ) -> Result<HabitEntryRecord> {
        self.write_completion(habit_id, date, Some(completed), note)
            .await
    }

    /// Flip the completion of `date`; a day without an entry becomes completed.
    pub async fn toggle_entry(&self, habit_id: &str, date: NaiveDate) -> Result<HabitEntryRecord> {
        self.write_completion(habit_id, date, None, None).await
    }

    async fn write_completion(
        &self,
        habit_id: &str,
        date: NaiveDate,
        completed: Option<bool>,
        note: Option<String>,
    ) -> Result<HabitEntryRecord> {
        let now = self.clock.now_millis();
        let queue = self.queue.clone();
        let habit_id = habit_id.to_string();
        self.store
            .transaction(
                &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                TransactionMode::ReadWrite,
                move |tx| {
                    let habit: HabitRecord = load_active_in(tx, &habit_id)?;
                    if habit.data.archived {
                        return Err(Error::ValidationFailed(format!(
                            "habit {habit_id} is archived"
                        )));
                    }
                    let key = Value::Array(HabitEntry::index_key(habit.id(), date).to_vec());
                    let existing = tx
                        .get_by_index(HABIT_ENTRIES, "habitId_date", &key)?
                        .into_iter()
                        .next()
                        .map(HabitEntryRecord::from_document)
                        .transpose()?;

                    let Some(mut record) = existing else {
                        let mut entry = HabitEntry::completed(habit.id(), date);
                        entry.completed = completed.unwrap_or(true);
                        entry.note = note;
                        entry.validate()?;
                        let record = Record::new_local(entry, now);
                        tx.put(HABIT_ENTRIES, &record.to_document()?)?;
                        queue.enqueue_in(
                            tx,
                            SyncOperation::new(
                                OperationType::Create,
                                EntityKind::HabitEntry,
                                record.id(),
                                record.payload()?,
                            )
                            .with_parent(Some(habit.id().to_string()))
                            .with_entity_version(record.meta.version),
                        )?;
                        return Ok(record);
                    };

                    let revived = record.meta.deleted;
                    let mut entry = if revived {
                        HabitEntry::completed(habit.id(), date)
                    } else {
                        record.data.clone()
                    };
                    let update = EntryUpdate {
                        completed: Some(completed.unwrap_or(revived || !entry.completed)),
                        note,
                    };
                    update.apply(&mut entry);
                    entry.validate()?;
                    if !revived && entry == record.data {
                        return Ok(record);
                    }
                    if revived {
                        // The unsent DELETE would otherwise purge the revived entry.
                        drop_unsent_deletes_in(tx, record.id())?;
                        record.meta.deleted = false;
                    }
                    record.data = entry;
                    record.meta.touch(now);
                    tx.put(HABIT_ENTRIES, &record.to_document()?)?;
                    queue.enqueue_in(
                        tx,
                        SyncOperation::new(
                            OperationType::Update,
                            EntityKind::HabitEntry,
                            record.id(),
                            record.payload()?,
                        )
                        .with_parent(Some(habit.id().to_string()))
                        .with_entity_version(record.meta.version),
                    )?;
                    Ok(record)
                },
            )
            .await
    }

    pub async fn update_entry(&self, id: &str, update: EntryUpdate) -> Result<HabitEntryRecord> {
        let now = self.clock.now_millis();
        let queue = self.queue.clone();
        let id = id.to_string();
        self.store
            .transaction(&[HABIT_ENTRIES, SYNC_QUEUE], TransactionMode::ReadWrite, move |tx| {
                let mut record: HabitEntryRecord = load_active_in(tx, &id)?;
                if update.is_empty() {
                    return Ok(record);
                }
                update.apply(&mut record.data);
                record.data.validate()?;
                record.meta.touch(now);
                tx.put(HABIT_ENTRIES, &record.to_document()?)?;
                queue.enqueue_in(
                    tx,
                    SyncOperation::new(
                        OperationType::Update,
                        EntityKind::HabitEntry,
                        &id,
                        record.payload()?,
                    )
                    .with_parent(Some(record.data.habit_id.clone()))
                    .with_entity_version(record.meta.version),
                )?;
                Ok(record)
            })
            .await
    }

    pub async fn delete_entry(&self, id: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let queue = self.queue.clone();
        let id = id.to_string();
        self.store
            .transaction(
                &[HABITS, HABIT_ENTRIES, SYNC_QUEUE],
                TransactionMode::ReadWrite,
                move |tx| {
                    let record: HabitEntryRecord = load_active_in(tx, &id)?;
                    retire_in(&queue, tx, record, now)
                },
            )
            .await
    }

    pub async fn get_entry(&self, id: &str) -> Result<HabitEntryRecord> {
        let id = id.to_string();
        self.store
            .transaction(&[HABIT_ENTRIES], TransactionMode::ReadOnly, move |tx| {
                load_active_in(tx, &id)
            })
            .await
    }

    /// Active entries ordered by date, optionally for one habit only.
    /// Entries of deleted habits are hidden.
    pub async fn list_entries(&self, habit_id: Option<&str>) -> Result<Vec<HabitEntryRecord>> {
        let habit_id = habit_id.map(ToString::to_string);
        let (habits, entries) = self
            .store
            .transaction(
                &[HABITS, HABIT_ENTRIES],
                TransactionMode::ReadOnly,
                move |tx| {
                    let entries = match habit_id.as_deref() {
                        Some(habit_id) => {
                            load_active_in::<Habit>(tx, habit_id)?;
                            tx.get_by_index(HABIT_ENTRIES, "habitId", &Value::from(habit_id))?
                        }
                        None => tx.get_all(HABIT_ENTRIES)?,
                    };
                    Ok((tx.get_all(HABITS)?, entries))
                },
            )
            .await?;
        let live: std::collections::HashSet<String> = decode_active::<Habit>(habits)?
            .into_iter()
            .map(|habit| habit.meta.id)
            .collect();
        let mut entries: Vec<HabitEntryRecord> = decode_active(entries)?
            .into_iter()
            .filter(|entry: &HabitEntryRecord| live.contains(&entry.data.habit_id))
            .collect();
        entries.sort_by(|a, b| {
            a.data
                .date
                .cmp(&b.data.date)
                .then_with(|| a.data.habit_id.cmp(&b.data.habit_id))
        });
        Ok(entries)
    }

    // Sync

    /// Run a sync pass now, or wait for the one already running.
    pub async fn sync(&self) -> Result<BatchReport> {
        let scheduler = self.require_scheduler()?;
        scheduler.sync_now().await.map_err(Error::from_shared)
    }

    fn require_scheduler(&self) -> Result<&Arc<SyncScheduler>> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| Error::NetworkFailure("no remote API configured".into()))
    }

    /// Sync events; `None` in local-only mode.
    pub fn subscribe_sync_events(&self) -> Option<broadcast::Receiver<SyncEvent>> {
        self.scheduler.as_ref().map(|scheduler| scheduler.subscribe())
    }

    /// Operations not yet completed, in queue order.
    pub async fn pending_operations(&self) -> Result<Vec<SyncOperation>> {
        Ok(self
            .queue
            .get_all()
            .await?
            .into_iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .collect())
    }

    /// Put every failed operation back in line.
    pub async fn retry_failed(&self) -> Result<usize> {
        self.queue.retry_all_failed().await
    }

    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get(METADATA, LAST_SYNC_KEY)
            .await?
            .and_then(|doc| doc.get("value").and_then(Value::as_i64)))
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let scheduler = self
            .scheduler
            .as_ref()
            .map_or_else(SchedulerStatus::default, |scheduler| scheduler.status());
        let connectivity = self.connectivity_status();
        let online = match (&connectivity, &self.scheduler) {
            (Some(status), _) => status.online,
            (None, Some(scheduler)) => scheduler.is_online(),
            (None, None) => false,
        };
        let mut status = SyncStatus {
            state: crate::state::SyncState::Offline,
            online,
            quality: connectivity.map(|status| status.quality),
            remote_configured: self.scheduler.is_some(),
            pending_operations: self.queue.size().await?,
            failed_operations: self.queue.get_failed_operations().await?.len(),
            unresolved_conflicts: self.conflicts.count_unresolved().await?,
            last_sync_at: self.last_sync_at().await?,
            scheduler,
        };
        status.state = status.derive_state();
        Ok(status)
    }

    // Conflicts

    pub async fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.conflicts.get_unresolved().await
    }

    /// Resolve one conflict. Returns the id of the UPDATE queued for it.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> Result<String> {
        self.conflicts.resolve_conflict(conflict_id, resolution).await
    }

    /// Resolve every open conflict with `policy`, or the configured policy.
    pub async fn resolve_conflicts(&self, policy: Option<AutoResolvePolicy>) -> Result<usize> {
        self.conflicts
            .resolve_all(policy.unwrap_or(self.config.conflicts.auto_resolve))
            .await
    }

    // Connectivity

    pub fn connectivity_status(&self) -> Option<ConnectivityStatus> {
        self.connectivity.as_ref().map(|monitor| monitor.status())
    }

    pub fn subscribe_connectivity(&self) -> Option<watch::Receiver<ConnectivityStatus>> {
        self.connectivity.as_ref().map(|monitor| monitor.subscribe())
    }

    /// Sample the network now; `None` when no sensor is configured.
    pub async fn check_connectivity(&self) -> Option<QualitySample> {
        match &self.connectivity {
            Some(monitor) => Some(monitor.check_now().await),
            None => None,
        }
    }

    // Maintenance

    pub async fn run_integrity_check(&self, options: IntegrityOptions) -> Result<IntegrityReport> {
        self.integrity.check(options).await
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self
            .integrity
            .recover(self.config.integrity.recovery_attempts)
            .await?;
        if !report.recovered {
            return Err(Error::IntegrityViolation(format!(
                "{} issues remain after {} recovery attempts",
                report.last.issues_found, report.attempts
            )));
        }
        Ok(report)
    }

    pub fn integrity_options(&self) -> IntegrityOptions {
        IntegrityOptions::from_config(&self.config.integrity)
    }

    pub async fn migrate(&self) -> Result<Vec<u32>> {
        self.migrator.migrate().await
    }

    pub async fn migrate_to(&self, version: u32) -> Result<Vec<u32>> {
        let current = self.migrator.get_current_version().await?;
        if version < current {
            self.migrator.rollback_to(version).await
        } else {
            self.migrator.migrate_to(version).await
        }
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        self.migrator.status().await
    }

    fn require_backups(&self) -> Result<&Arc<BackupManager>> {
        self.backups.as_ref().ok_or_else(|| {
            Error::ValidationFailed("no backup directory configured (set backup_dir or db_path)".into())
        })
    }

    pub async fn create_backup(&self, reason: &str) -> Result<BackupInfo> {
        let backups = self.require_backups()?;
        let info = backups.create(&self.store, reason).await?;
        backups.prune(self.config.integrity.keep_backups)?;
        Ok(info)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.require_backups()?.list()
    }

    pub async fn restore_backup(&self, path: &Path) -> Result<Backup> {
        self.require_backups()?.restore(&self.store, path).await
    }
}

/// Remove a never-synced record outright, or soft-delete and queue a DELETE.
///
/// A record still carrying its temporary id has no server row of its own to
/// remove. If its CREATE is already on the wire, the sync pass that sees the
/// response finds the record gone and queues the DELETE itself.
fn retire_in<T: SyncEntity>(
    queue: &SyncQueue,
    tx: &mut StoreTransaction<'_>,
    mut record: Record<T>,
    now: i64,
) -> Result<()> {
    if is_temp_id(record.id()) {
        return purge_entity_in(tx, T::KIND, record.id(), None);
    }
    record.meta.touch(now);
    record.meta.deleted = true;
    tx.put(T::KIND.collection(), &record.to_document()?)?;
    queue.enqueue_in(
        tx,
        SyncOperation::new(
            OperationType::Delete,
            T::KIND,
            record.id(),
            record.payload()?,
        )
        .with_parent(record.data.parent_id().map(ToString::to_string))
        .with_entity_version(record.meta.version),
    )?;
    Ok(())
}

/// Load a record that exists and is not soft-deleted.
fn load_active_in<T: SyncEntity>(tx: &StoreTransaction<'_>, id: &str) -> Result<Record<T>> {
    let document = tx
        .get(T::KIND.collection(), id)?
        .ok_or_else(|| Error::NotFound(format!("{} {id}", T::KIND)))?;
    let record = Record::<T>::from_document(document)?;
    if record.meta.deleted {
        return Err(Error::NotFound(format!("{} {id} was deleted", T::KIND)));
    }
    Ok(record)
}

fn decode_active<T: SyncEntity>(documents: Vec<Value>) -> Result<Vec<Record<T>>> {
    let mut records = Vec::with_capacity(documents.len());
    for document in documents {
        let record = Record::<T>::from_document(document)?;
        if !record.meta.deleted {
            records.push(record);
        }
    }
    Ok(records)
}

fn ensure_unique_name_in(tx: &StoreTransaction<'_>, key: &str, except: Option<&str>) -> Result<()> {
    let taken = decode_active::<Habit>(tx.get_all(HABITS)?)?
        .iter()
        .any(|habit| Some(habit.id()) != except && habit.data.domain_key() == key);
    if taken {
        return Err(Error::ValidationFailed(format!(
            "a habit named '{key}' already exists"
        )));
    }
    Ok(())
}

fn drop_unsent_deletes_in(tx: &mut StoreTransaction<'_>, entity_id: &str) -> Result<()> {
    for op in queue::for_entity_in(tx, entity_id)? {
        if op.entity_id == entity_id
            && op.op_type == OperationType::Delete
            && op.status != OperationStatus::Completed
        {
            tx.delete(SYNC_QUEUE, &op.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::test_support::FakeRemote;
    use pretty_assertions::assert_eq;

    struct Fixture {
        engine: HabitSyncEngine,
        remote: Arc<FakeRemote>,
    }

    async fn setup() -> Fixture {
        let remote = Arc::new(FakeRemote::default());
        let engine = HabitSyncEngine::builder(EngineConfig::default())
            .remote(remote.clone())
            .clock(Arc::new(ManualClock::new(1_000)))
            .open()
            .await
            .unwrap();
        Fixture { engine, remote }
    }

    fn day(value: &str) -> NaiveDate {
        HabitEntry::parse_date(value).unwrap()
    }

    #[tokio::test]
    async fn offline_create_queues_one_operation() {
        let fixture = setup().await;
        let habit = fixture
            .engine
            .create_habit(Habit::new("Exercise"))
            .await
            .unwrap();
        assert!(!habit.meta.synced);

        let ops = fixture.engine.pending_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Create);
        assert_eq!(ops[0].entity_id, habit.id());
        assert_eq!(fixture.remote.total_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_writes_never_reach_the_queue() {
        let fixture = setup().await;
        assert!(matches!(
            fixture.engine.create_habit(Habit::new("  ")).await,
            Err(Error::ValidationFailed(_))
        ));
        assert!(matches!(
            fixture
                .engine
                .update_habit("missing", HabitUpdate::name("X"))
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fixture
                .engine
                .set_completion("missing", day("2024-01-01"), true, None)
                .await,
            Err(Error::NotFound(_))
        ));
        fixture.engine.create_habit(Habit::new("Read")).await.unwrap();
        assert!(matches!(
            fixture.engine.create_habit(Habit::new(" read ")).await,
            Err(Error::ValidationFailed(_))
        ));
        assert_eq!(fixture.engine.pending_operations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consecutive_updates_merge_into_one() {
        let fixture = setup().await;
        fixture.engine.create_habit(Habit::new("Walk")).await.unwrap();
        fixture.engine.sync().await.unwrap();
        let id = fixture.engine.list_habits(false).await.unwrap()[0]
            .id()
            .to_string();
        assert_eq!(id, "habit_1");

        fixture
            .engine
            .update_habit(&id, HabitUpdate::name("X"))
            .await
            .unwrap();
        fixture
            .engine
            .update_habit(&id, HabitUpdate::name("Y"))
            .await
            .unwrap();
        let ops = fixture.engine.pending_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Update);
        assert_eq!(ops[0].payload["name"], "Y");
    }

    #[tokio::test]
    async fn deleting_unsynced_habit_cancels_its_operations() {
        let fixture = setup().await;
        let habit = fixture.engine.create_habit(Habit::new("Stretch")).await.unwrap();
        fixture
            .engine
            .toggle_entry(habit.id(), day("2024-02-01"))
            .await
            .unwrap();
        assert_eq!(fixture.engine.pending_operations().await.unwrap().len(), 2);

        fixture.engine.delete_habit(habit.id()).await.unwrap();
        assert!(fixture.engine.pending_operations().await.unwrap().is_empty());
        assert!(fixture.engine.list_entries(None).await.unwrap().is_empty());
        assert!(matches!(
            fixture.engine.get_habit(habit.id()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn toggling_twice_flips_completion() {
        let fixture = setup().await;
        let habit = fixture.engine.create_habit(Habit::new("Floss")).await.unwrap();
        let first = fixture
            .engine
            .toggle_entry(habit.id(), day("2024-02-01"))
            .await
            .unwrap();
        assert!(first.data.completed);
        let second = fixture
            .engine
            .toggle_entry(habit.id(), day("2024-02-01"))
            .await
            .unwrap();
        assert_eq!(second.id(), first.id());
        assert!(!second.data.completed);
        assert_eq!(second.meta.version, 2);
    }

    #[tokio::test]
    async fn recompleting_a_deleted_day_revives_the_entry() {
        let fixture = setup().await;
        let habit = fixture.engine.create_habit(Habit::new("Journal")).await.unwrap();
        fixture
            .engine
            .toggle_entry(habit.id(), day("2024-02-01"))
            .await
            .unwrap();
        fixture.engine.sync().await.unwrap();
        let entry = fixture.engine.list_entries(None).await.unwrap().remove(0);
        assert!(entry.meta.synced);

        fixture.engine.delete_entry(entry.id()).await.unwrap();
        let revived = fixture
            .engine
            .set_completion("habit_1", day("2024-02-01"), true, Some("again".into()))
            .await
            .unwrap();
        assert_eq!(revived.id(), entry.id());
        assert!(!revived.meta.deleted);
        assert_eq!(revived.data.note.as_deref(), Some("again"));

        let ops = fixture.engine.pending_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Update);
    }

    #[tokio::test]
    async fn status_reflects_queue_and_last_sync() {
        let fixture = setup().await;
        fixture.engine.create_habit(Habit::new("Meditate")).await.unwrap();
        let status = fixture.engine.status().await.unwrap();
        assert_eq!(status.pending_operations, 1);
        assert_eq!(status.state, crate::state::SyncState::Pending);

        let report = fixture.engine.sync().await.unwrap();
        assert_eq!(report.successful, 1);
        let status = fixture.engine.status().await.unwrap();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.last_sync_at, Some(1_000));
        assert_eq!(status.state, crate::state::SyncState::Synced);
    }

    #[tokio::test]
    async fn offline_sync_leaves_last_sync_unset() {
        let fixture = setup().await;
        fixture.engine.create_habit(Habit::new("Swim")).await.unwrap();
        fixture.remote.set_offline(true);

        let report = fixture.engine.sync().await.unwrap();
        assert_eq!(report.network_errors, 1);
        let status = fixture.engine.status().await.unwrap();
        assert_eq!(status.last_sync_at, None);
        assert_eq!(status.failed_operations, 1);
        assert_eq!(fixture.engine.last_sync_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_a_synced_habit_queues_a_delete() {
        let fixture = setup().await;
        fixture.engine.create_habit(Habit::new("Run")).await.unwrap();
        fixture.engine.sync().await.unwrap();

        fixture.engine.delete_habit("habit_1").await.unwrap();
        let ops = fixture.engine.pending_operations().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Delete);
        assert_eq!(ops[0].entity_id, "habit_1");

        fixture.engine.sync().await.unwrap();
        assert_eq!(fixture.remote.delete_calls(), 1);
        assert!(fixture.remote.record("habit_1").is_none());
    }

    #[tokio::test]
    async fn local_only_engine_refuses_to_sync() {
        let engine = HabitSyncEngine::builder(EngineConfig::default())
            .clock(Arc::new(ManualClock::new(0)))
            .open()
            .await
            .unwrap();
        assert!(engine.sync().await.unwrap_err().is_network());
        assert!(!engine.status().await.unwrap().remote_configured);
    }
}
