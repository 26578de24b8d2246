//! Versioned document migrations

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::backup::BackupManager;
use super::connection::Store;
use super::schema::{HABITS, HABIT_ENTRIES, METADATA};
use super::transaction::{StoreTransaction, TransactionMode};
use crate::error::{Error, Result};
use crate::util::{new_id, unix_millis_now};

/// Metadata document holding the applied schema version
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Metadata document identifying this installation
pub const DEVICE_ID_KEY: &str = "deviceId";

/// Body of a migration step, run inside one store transaction
pub type MigrationStep = Arc<dyn Fn(&mut StoreTransaction<'_>) -> Result<()> + Send + Sync>;

/// Post-condition checked before a step is committed
pub type MigrationCheck = Arc<dyn Fn(&StoreTransaction<'_>) -> Result<bool> + Send + Sync>;

pub struct Migration {
    pub version: u32,
    pub description: String,
    /// Restructures data in a way that warrants a backup first
    pub risky: bool,
    up: MigrationStep,
    down: Option<MigrationStep>,
    validate: Option<MigrationCheck>,
}

impl Migration {
    pub fn new(
        version: u32,
        description: impl Into<String>,
        up: impl Fn(&mut StoreTransaction<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            risky: false,
            up: Arc::new(up),
            down: None,
            validate: None,
        }
    }

    #[must_use]
    pub fn with_down(
        mut self,
        down: impl Fn(&mut StoreTransaction<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.down = Some(Arc::new(down));
        self
    }

    #[must_use]
    pub fn with_validate(
        mut self,
        validate: impl Fn(&StoreTransaction<'_>) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }

    #[must_use]
    pub const fn risky(mut self) -> Self {
        self.risky = true;
        self
    }

    pub const fn reversible(&self) -> bool {
        self.down.is_some()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("risky", &self.risky)
            .field("reversible", &self.reversible())
            .finish_non_exhaustive()
    }
}

/// A migration that has not been applied yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMigration {
    pub version: u32,
    pub description: String,
    pub risky: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub current_version: u32,
    pub target_version: u32,
    pub pending: Vec<PendingMigration>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Applies and rolls back [`Migration`]s in version order.
///
/// Each step, its validation and the version bump share one transaction, so
/// a failing step leaves the store at the last successfully applied version.
pub struct Migrator {
    store: Arc<Store>,
    migrations: Vec<Migration>,
    backups: Option<Arc<BackupManager>>,
}

impl Migrator {
    pub fn new(store: Arc<Store>, mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|migration| migration.version);
        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(Error::MigrationFailure {
                    version: pair[0].version,
                    reason: "registered twice".into(),
                });
            }
        }
        if let Some(first) = migrations.first() {
            if first.version == 0 {
                return Err(Error::MigrationFailure {
                    version: 0,
                    reason: "version 0 is reserved for an empty store".into(),
                });
            }
        }
        Ok(Self {
            store,
            migrations,
            backups: None,
        })
    }

    /// Back up the store before risky migrations and rollbacks.
    #[must_use]
    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn target_version(&self) -> u32 {
        self.migrations.last().map_or(0, |migration| migration.version)
    }

    pub async fn get_current_version(&self) -> Result<u32> {
        stored_version(&self.store).await
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let current_version = self.get_current_version().await?;
        Ok(MigrationStatus {
            current_version,
            target_version: self.target_version(),
            pending: self
                .migrations
                .iter()
                .filter(|migration| migration.version > current_version)
                .map(|migration| PendingMigration {
                    version: migration.version,
                    description: migration.description.clone(),
                    risky: migration.risky,
                })
                .collect(),
        })
    }

    /// Apply every pending migration. Returns the versions applied.
    pub async fn migrate(&self) -> Result<Vec<u32>> {
        self.migrate_to(self.target_version()).await
    }

    /// Apply pending migrations up to and including `target`.
    pub async fn migrate_to(&self, target: u32) -> Result<Vec<u32>> {
        let current = self.get_current_version().await?;
        if target < current {
            return Err(Error::MigrationFailure {
                version: target,
                reason: format!("store is already at version {current}; use rollback"),
            });
        }
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|migration| migration.version > current && migration.version <= target)
            .collect();
        if pending.is_empty() {
            tracing::debug!("Schema is up to date at version {current}");
            return Ok(Vec::new());
        }

        if pending.iter().any(|migration| migration.risky) {
            self.backup(&format!("before migrating v{current} to v{target}"))
                .await?;
        }

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            self.apply_up(migration).await.map_err(|error| {
                tracing::warn!(
                    "Migration v{} ({}) failed, store left at v{}: {error}",
                    migration.version,
                    migration.description,
                    applied.last().copied().unwrap_or(current)
                );
                into_migration_failure(migration.version, error)
            })?;
            tracing::info!(
                "Migrated store to version {} ({})",
                migration.version,
                migration.description
            );
            applied.push(migration.version);
        }
        Ok(applied)
    }

    async fn apply_up(&self, migration: &Migration) -> Result<()> {
        let names = self.store.schema().names();
        let scope: Vec<&str> = names.iter().map(String::as_str).collect();
        let up = Arc::clone(&migration.up);
        let validate = migration.validate.clone();
        let version = migration.version;
        self.store
            .transaction(&scope, TransactionMode::ReadWrite, move |tx| {
                up(tx)?;
                if let Some(validate) = &validate {
                    if !validate(tx)? {
                        return Err(Error::MigrationFailure {
                            version,
                            reason: "validation failed after applying".into(),
                        });
                    }
                }
                write_version_in(tx, version)
            })
            .await
    }

    /// Undo applied migrations down to `target`, newest first.
    ///
    /// Refuses up front if any migration in the range cannot be undone.
    pub async fn rollback_to(&self, target: u32) -> Result<Vec<u32>> {
        let current = self.get_current_version().await?;
        if target >= current {
            return Ok(Vec::new());
        }
        let applied: Vec<&Migration> = self
            .migrations
            .iter()
            .rev()
            .filter(|migration| migration.version > target && migration.version <= current)
            .collect();
        if let Some(blocking) = applied.iter().find(|migration| !migration.reversible()) {
            return Err(Error::MigrationFailure {
                version: blocking.version,
                reason: format!(
                    "cannot roll back past '{}': it has no down step",
                    blocking.description
                ),
            });
        }

        self.backup(&format!("before rolling back v{current} to v{target}"))
            .await?;

        let mut undone = Vec::with_capacity(applied.len());
        for migration in applied {
            let previous = self.previous_version(migration.version).max(target);
            self.apply_down(migration, previous)
                .await
                .map_err(|error| into_migration_failure(migration.version, error))?;
            tracing::info!(
                "Rolled back migration {} ({})",
                migration.version,
                migration.description
            );
            undone.push(migration.version);
        }
        Ok(undone)
    }

    async fn apply_down(&self, migration: &Migration, previous: u32) -> Result<()> {
        let names = self.store.schema().names();
        let scope: Vec<&str> = names.iter().map(String::as_str).collect();
        let down = migration.down.clone();
        self.store
            .transaction(&scope, TransactionMode::ReadWrite, move |tx| {
                if let Some(down) = &down {
                    down(tx)?;
                }
                write_version_in(tx, previous)
            })
            .await
    }

    fn previous_version(&self, version: u32) -> u32 {
        self.migrations
            .iter()
            .map(|migration| migration.version)
            .filter(|candidate| *candidate < version)
            .max()
            .unwrap_or(0)
    }

    async fn backup(&self, reason: &str) -> Result<()> {
        match &self.backups {
            Some(backups) => {
                backups.create(&self.store, reason).await?;
            }
            None => tracing::warn!("No backup directory configured; skipping backup ({reason})"),
        }
        Ok(())
    }
}

fn into_migration_failure(version: u32, error: Error) -> Error {
    match error {
        Error::MigrationFailure { .. } => error,
        other => Error::MigrationFailure {
            version,
            reason: other.to_string(),
        },
    }
}

/// Schema version recorded in the store; 0 when none was ever written.
pub async fn stored_version(store: &Store) -> Result<u32> {
    store
        .transaction(&[METADATA], TransactionMode::ReadOnly, |tx| {
            stored_version_in(tx)
        })
        .await
}

pub fn stored_version_in(tx: &StoreTransaction<'_>) -> Result<u32> {
    Ok(tx
        .get(METADATA, SCHEMA_VERSION_KEY)?
        .and_then(|doc| doc.get("value").and_then(Value::as_u64))
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(0))
}

fn write_version_in(tx: &mut StoreTransaction<'_>, version: u32) -> Result<()> {
    tx.put(
        METADATA,
        &json!({ "id": SCHEMA_VERSION_KEY, "value": version }),
    )?;
    Ok(())
}

/// Migrations shipped with the engine.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "baseline metadata", |tx| {
            if tx.get(METADATA, DEVICE_ID_KEY)?.is_none() {
                tx.put(
                    METADATA,
                    &json!({ "id": DEVICE_ID_KEY, "value": new_id(), "createdAt": unix_millis_now() }),
                )?;
            }
            Ok(())
        })
        .with_down(|tx| {
            tx.delete(METADATA, DEVICE_ID_KEY)?;
            Ok(())
        }),
        Migration::new(2, "backfill sync metadata", |tx| {
            let now = unix_millis_now();
            for collection in [HABITS, HABIT_ENTRIES] {
                for mut document in tx.get_all(collection)? {
                    if backfill_sync_meta(&mut document, now) {
                        tx.put(collection, &document)?;
                    }
                }
            }
            Ok(())
        })
        .with_validate(|tx| {
            for collection in [HABITS, HABIT_ENTRIES] {
                if tx.get_all(collection)?.iter().any(missing_sync_meta) {
                    return Ok(false);
                }
            }
            Ok(true)
        }),
        Migration::new(3, "normalize entry dates", |tx| {
            for mut document in tx.get_all(HABIT_ENTRIES)? {
                if normalize_entry(&mut document) {
                    tx.put(HABIT_ENTRIES, &document)?;
                }
            }
            Ok(())
        })
        .with_validate(|tx| {
            Ok(tx.get_all(HABIT_ENTRIES)?.iter().all(|entry| {
                entry
                    .get("date")
                    .and_then(Value::as_str)
                    .is_some_and(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok())
            }))
        })
        .risky(),
    ]
}

fn missing_sync_meta(document: &Value) -> bool {
    ["version", "lastModified", "synced", "deleted"]
        .iter()
        .any(|field| document.get(field).map_or(true, Value::is_null))
}

/// Fill absent sync fields. Returns whether anything changed.
pub(crate) fn backfill_sync_meta(document: &mut Value, now: i64) -> bool {
    let Some(map) = document.as_object_mut() else {
        return false;
    };
    let synced = map.get("serverId").is_some_and(Value::is_string);
    let mut changed = false;
    let defaults = [
        ("version", json!(1)),
        ("lastModified", json!(now)),
        ("synced", json!(synced)),
        ("deleted", json!(false)),
    ];
    for (field, default) in defaults {
        if map.get(field).map_or(true, Value::is_null) {
            map.insert(field.to_string(), default);
            changed = true;
        }
    }
    changed
}

fn normalize_entry(document: &mut Value) -> bool {
    let Some(map) = document.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    if let Some(raw) = map.get("date").and_then(Value::as_str).map(ToString::to_string) {
        if let Some(day) = normalize_date(&raw) {
            if day != raw {
                map.insert("date".into(), Value::String(day));
                changed = true;
            }
        }
    }
    if !map.get("completed").is_some_and(Value::is_boolean) {
        map.insert("completed".into(), Value::Bool(true));
        changed = true;
    }
    changed
}

/// Best-effort conversion of legacy date spellings to `YYYY-MM-DD`.
fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Some(timestamp.date_naive().format("%Y-%m-%d").to_string());
    }
    ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%m/%d/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .map(|day| day.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::default_schema;
    use crate::sync::clock::ManualClock;
    use pretty_assertions::assert_eq;

    async fn store() -> Arc<Store> {
        Arc::new(Store::open_in_memory(default_schema()).await.unwrap())
    }

    #[tokio::test]
    async fn migrate_is_monotonic_and_idempotent() {
        let store = store().await;
        let migrator = Migrator::new(store.clone(), builtin_migrations()).unwrap();
        assert_eq!(migrator.get_current_version().await.unwrap(), 0);

        assert_eq!(migrator.migrate().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(migrator.get_current_version().await.unwrap(), 3);
        assert!(migrator.status().await.unwrap().is_up_to_date());
        assert_eq!(migrator.migrate().await.unwrap(), Vec::<u32>::new());
        assert!(store.get(METADATA, DEVICE_ID_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn legacy_records_are_upgraded() {
        let store = store().await;
        store
            .put(HABITS, &json!({"id": "h1", "name": "Read", "serverId": "srv"}))
            .await
            .unwrap();
        store
            .put(
                HABIT_ENTRIES,
                &json!({"id": "e1", "habitId": "h1", "date": "2024-03-05T08:00:00Z"}),
            )
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let backups = Arc::new(BackupManager::new(
            dir.path(),
            Arc::new(ManualClock::new(1)),
        ));
        Migrator::new(store.clone(), builtin_migrations())
            .unwrap()
            .with_backups(backups.clone())
            .migrate()
            .await
            .unwrap();

        let habit = store.get(HABITS, "h1").await.unwrap().unwrap();
        assert_eq!(habit["version"], json!(1));
        assert_eq!(habit["synced"], json!(true));
        assert_eq!(habit["deleted"], json!(false));
        let entry = store.get(HABIT_ENTRIES, "e1").await.unwrap().unwrap();
        assert_eq!(entry["date"], json!("2024-03-05"));
        assert_eq!(entry["completed"], json!(true));
        // v3 is risky, so a backup was taken first.
        assert_eq!(backups.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_step_halts_at_last_good_version() {
        let store = store().await;
        let migrations = vec![
            Migration::new(1, "ok", |_| Ok(())),
            Migration::new(2, "boom", |tx| {
                tx.put(METADATA, &json!({"id": "partial", "value": true}))?;
                Err(Error::ValidationFailed("bad data".into()))
            }),
            Migration::new(3, "never runs", |_| Ok(())),
        ];
        let migrator = Migrator::new(store.clone(), migrations).unwrap();
        let error = migrator.migrate().await.unwrap_err();
        assert!(matches!(error, Error::MigrationFailure { version: 2, .. }));
        assert_eq!(migrator.get_current_version().await.unwrap(), 1);
        assert!(store.get(METADATA, "partial").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validation_failure_rolls_the_step_back() {
        let store = store().await;
        let migrations = vec![Migration::new(1, "writes", |tx| {
            tx.put(METADATA, &json!({"id": "flag", "value": 1}))?;
            Ok(())
        })
        .with_validate(|_| Ok(false))];
        let migrator = Migrator::new(store.clone(), migrations).unwrap();
        assert!(migrator.migrate().await.is_err());
        assert_eq!(migrator.get_current_version().await.unwrap(), 0);
        assert!(store.get(METADATA, "flag").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_requires_down_steps() {
        let store = store().await;
        let migrator = Migrator::new(store.clone(), builtin_migrations()).unwrap();
        migrator.migrate().await.unwrap();

        // v3 and v2 have no down step.
        let error = migrator.rollback_to(0).await.unwrap_err();
        assert!(matches!(error, Error::MigrationFailure { version: 3, .. }));
        assert_eq!(migrator.get_current_version().await.unwrap(), 3);

        let reversible = vec![
            Migration::new(1, "one", |tx| {
                tx.put(METADATA, &json!({"id": "one", "value": 1}))?;
                Ok(())
            })
            .with_down(|tx| {
                tx.delete(METADATA, "one")?;
                Ok(())
            }),
            Migration::new(2, "two", |_| Ok(())).with_down(|_| Ok(())),
        ];
        let store = self::store().await;
        let migrator = Migrator::new(store.clone(), reversible).unwrap();
        migrator.migrate().await.unwrap();
        assert_eq!(migrator.rollback_to(0).await.unwrap(), vec![2, 1]);
        assert_eq!(migrator.get_current_version().await.unwrap(), 0);
        assert!(store.get(METADATA, "one").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_versions_are_rejected() {
        let result = Migrator::new(
            store().await,
            vec![
                Migration::new(1, "a", |_| Ok(())),
                Migration::new(1, "b", |_| Ok(())),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn legacy_date_formats() {
        assert_eq!(normalize_date("2024/01/02").as_deref(), Some("2024-01-02"));
        assert_eq!(normalize_date("01/02/2024").as_deref(), Some("2024-01-02"));
        assert_eq!(normalize_date("nonsense"), None);
    }
}
