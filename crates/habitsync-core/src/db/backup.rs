//! JSON snapshots of the whole store, written outside of it

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::connection::{Snapshot, Store};
use super::migrations::stored_version;
use crate::error::{Error, Result};
use crate::sync::clock::Clock;

const BACKUP_PREFIX: &str = "backup-";
const BACKUP_EXTENSION: &str = "json";
const BACKUP_FORMAT: u32 = 1;

/// Full contents of a backup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub format: u32,
    pub created_at: i64,
    pub schema_version: u32,
    pub reason: String,
    pub collections: Snapshot,
}

impl Backup {
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

/// Listing entry for a backup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at: i64,
    pub schema_version: u32,
    pub reason: String,
    pub records: usize,
}

impl BackupInfo {
    fn describe(path: PathBuf, backup: &Backup) -> Self {
        Self {
            path,
            created_at: backup.created_at,
            schema_version: backup.schema_version,
            reason: backup.reason.clone(),
            records: backup.record_count(),
        }
    }
}

/// Writes and restores `backup-<timestamp>.json` files in one directory.
pub struct BackupManager {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot every collection of `store` into a new backup file.
    pub async fn create(&self, store: &Store, reason: &str) -> Result<BackupInfo> {
        let schema_version = stored_version(store).await?;
        let collections = store.snapshot().await?;
        let backup = Backup {
            format: BACKUP_FORMAT,
            created_at: self.clock.now_millis(),
            schema_version,
            reason: reason.to_string(),
            collections,
        };

        fs::create_dir_all(&self.dir)?;
        let path = self.free_path(backup.created_at);
        fs::write(&path, serde_json::to_vec_pretty(&backup)?)?;
        let info = BackupInfo::describe(path, &backup);
        tracing::info!(
            "Backup written to {} ({} records, reason: {reason})",
            info.path.display(),
            info.records
        );
        Ok(info)
    }

    fn free_path(&self, created_at: i64) -> PathBuf {
        let mut path = self
            .dir
            .join(format!("{BACKUP_PREFIX}{created_at}.{BACKUP_EXTENSION}"));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!(
                "{BACKUP_PREFIX}{created_at}-{suffix}.{BACKUP_EXTENSION}"
            ));
            suffix += 1;
        }
        path
    }

    /// Backups in the directory, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !is_backup_file(&path) {
                continue;
            }
            match Self::load(&path) {
                Ok(backup) => backups.push(BackupInfo::describe(path, &backup)),
                Err(error) => {
                    tracing::warn!("Skipping unreadable backup {}: {error}", path.display());
                }
            }
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(backups)
    }

    pub fn latest(&self) -> Result<Option<BackupInfo>> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn load(path: &Path) -> Result<Backup> {
        let raw = fs::read(path)?;
        let backup: Backup = serde_json::from_slice(&raw)?;
        if backup.format != BACKUP_FORMAT {
            return Err(Error::ValidationFailed(format!(
                "unsupported backup format {} in {}",
                backup.format,
                path.display()
            )));
        }
        Ok(backup)
    }

    /// Replace the store contents with the backup, in one transaction.
    pub async fn restore(&self, store: &Store, path: &Path) -> Result<Backup> {
        let backup = Self::load(path)?;
        for name in backup.collections.keys() {
            store.schema().collection(name)?;
        }
        store.restore(&backup.collections).await?;
        tracing::warn!(
            "Store restored from {} (schema version {})",
            path.display(),
            backup.schema_version
        );
        Ok(backup)
    }

    /// Delete all but the `keep` newest backups. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for stale in self.list()?.into_iter().skip(keep) {
            fs::remove_file(&stale.path)?;
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!("Pruned {removed} old backups");
        }
        Ok(removed)
    }
}

fn is_backup_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == BACKUP_EXTENSION)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(BACKUP_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::default_schema;
    use crate::db::schema::HABITS;
    use crate::sync::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn create_list_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(5_000));
        let manager = BackupManager::new(dir.path(), clock.clone());
        let store = Store::open_in_memory(default_schema()).await.unwrap();
        store
            .put(HABITS, &json!({"id": "h1", "name": "Read"}))
            .await
            .unwrap();

        let info = manager.create(&store, "manual").await.unwrap();
        assert_eq!(info.records, 1);
        assert!(info.path.ends_with("backup-5000.json"));

        store.delete(HABITS, "h1").await.unwrap();
        store
            .put(HABITS, &json!({"id": "h2", "name": "Run"}))
            .await
            .unwrap();

        let restored = manager.restore(&store, &info.path).await.unwrap();
        assert_eq!(restored.reason, "manual");
        let ids: Vec<_> = store
            .get_all(HABITS)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["h1".to_string()]);

        clock.advance(Duration::from_secs(1));
        manager.create(&store, "second").await.unwrap();
        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].reason, "second");
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = BackupManager::new(dir.path(), clock.clone());
        let store = Store::open_in_memory(default_schema()).await.unwrap();
        for _ in 0..4 {
            manager.create(&store, "scheduled").await.unwrap();
            clock.advance(Duration::from_millis(10));
        }
        // Junk files are ignored.
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        assert_eq!(manager.prune(2).unwrap(), 2);
        let left = manager.list().unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].created_at, 1_030);
    }

    #[tokio::test]
    async fn same_millisecond_backups_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path(), Arc::new(ManualClock::new(7)));
        let store = Store::open_in_memory(default_schema()).await.unwrap();
        let first = manager.create(&store, "a").await.unwrap();
        let second = manager.create(&store, "b").await.unwrap();
        assert!(first.path != second.path);
        assert_eq!(manager.list().unwrap().len(), 2);
    }
}
