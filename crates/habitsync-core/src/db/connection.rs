//! Local store: durable, indexed, transactional JSON document storage

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::StoreSchema;
use super::transaction::{StoreTransaction, TransactionMode};
use crate::error::{Error, Result};

/// All collections serialized as one value, keyed by collection name
pub type Snapshot = BTreeMap<String, Vec<Value>>;

/// Page request for [`Store::paginate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    /// Rows to skip; only honoured on the first page (no cursor)
    #[serde(default)]
    pub offset: usize,
    /// Order by this index instead of the primary key
    #[serde(default)]
    pub index: Option<String>,
    /// Continuation token from the previous page
    #[serde(default)]
    pub cursor: Option<String>,
}

impl PageRequest {
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            offset: 0,
            index: None,
            cursor: None,
        }
    }

    #[must_use]
    pub const fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    pub has_more: bool,
    /// Pass back as `PageRequest::cursor` to continue
    pub cursor: Option<String>,
}

/// Local document store backed by `SQLite`.
///
/// Every collection is a table of JSON documents keyed by `id`; secondary
/// indexes are expression indexes declared in the [`StoreSchema`].
/// `SQLite` work runs on the blocking thread pool, one transaction at a time.
pub struct Store {
    schema: Arc<StoreSchema>,
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Create an unopened store; every operation fails with `NotInitialized`
    /// until [`Store::open_connection`] runs.
    pub fn new(schema: StoreSchema) -> Self {
        Self {
            schema: Arc::new(schema),
            conn: Arc::new(Mutex::new(None)),
            path: None,
        }
    }

    /// Open a store at the given path, creating it if it doesn't exist
    pub async fn open(path: impl AsRef<Path>, schema: StoreSchema) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut store = Self::new(schema);
        store.path = Some(path.clone());
        let conn = run_blocking(move || Ok(Connection::open(&path)?)).await?;
        store.open_connection(conn).await?;
        Ok(store)
    }

    /// Open an in-memory store (useful for testing)
    pub async fn open_in_memory(schema: StoreSchema) -> Result<Self> {
        let store = Self::new(schema);
        store.open_connection(Connection::open_in_memory()?).await?;
        Ok(store)
    }

    /// Install a connection: configure it and run the index-upgrade pass.
    pub async fn open_connection(&self, mut conn: Connection) -> Result<()> {
        self.schema.validate()?;
        let schema = Arc::clone(&self.schema);
        let slot = Arc::clone(&self.conn);
        run_blocking(move || {
            configure(&conn)?;
            let created = upgrade_indexes(&mut conn, &schema)?;
            if !created.is_empty() {
                tracing::info!("Created {} store objects: {}", created.len(), created.join(", "));
            }
            *lock(&slot) = Some(conn);
            Ok(())
        })
        .await
    }

    /// Close the underlying connection. Later operations fail with `NotInitialized`.
    pub async fn close(&self) {
        let slot = Arc::clone(&self.conn);
        let closed = run_blocking(move || {
            lock(&slot).take();
            Ok(())
        })
        .await;
        if let Err(error) = closed {
            tracing::warn!("Failed to close store: {error}");
        }
    }

    pub async fn is_open(&self) -> bool {
        let slot = Arc::clone(&self.conn);
        run_blocking(move || Ok(lock(&slot).is_some()))
            .await
            .unwrap_or(false)
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `body` with access to `collections` on the blocking thread pool.
    ///
    /// Commits when `body` returns `Ok`, rolls everything back and returns the
    /// original error otherwise. A panic inside `body` rolls back and resumes
    /// on the calling task.
    pub async fn transaction<T, F>(
        &self,
        collections: &[&str],
        mode: TransactionMode,
        body: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T> + Send + 'static,
    {
        for name in collections {
            self.schema.collection(name)?;
        }
        let scope: Vec<String> = collections.iter().map(ToString::to_string).collect();
        let schema = Arc::clone(&self.schema);
        let slot = Arc::clone(&self.conn);
        run_blocking(move || {
            let mut guard = lock(&slot);
            let conn = guard.as_mut().ok_or(Error::NotInitialized)?;
            let behavior = match mode {
                TransactionMode::ReadOnly => TransactionBehavior::Deferred,
                TransactionMode::ReadWrite => TransactionBehavior::Immediate,
            };
            let tx = conn.transaction_with_behavior(behavior)?;
            let mut scoped = StoreTransaction::new(tx, &schema, scope, mode);
            match body(&mut scoped) {
                Ok(value) => {
                    scoped.commit()?;
                    Ok(value)
                }
                Err(error) => {
                    // Dropping the transaction rolls it back.
                    drop(scoped);
                    Err(error)
                }
            }
        })
        .await
    }

    async fn read<T, F>(&self, collection: &str, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreTransaction<'_>, &str) -> Result<T> + Send + 'static,
    {
        let name = collection.to_string();
        self.transaction(&[collection], TransactionMode::ReadOnly, move |tx| {
            body(tx, &name)
        })
        .await
    }

    async fn write<T, F>(&self, collection: &str, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreTransaction<'_>, &str) -> Result<T> + Send + 'static,
    {
        let name = collection.to_string();
        self.transaction(&[collection], TransactionMode::ReadWrite, move |tx| {
            body(tx, &name)
        })
        .await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let id = id.to_string();
        self.read(collection, move |tx, name| tx.get(name, &id)).await
    }

    pub async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        self.read(collection, |tx, name| tx.get_all(name)).await
    }

    pub async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Value>> {
        let index = index.to_string();
        let value = value.clone();
        self.read(collection, move |tx, name| tx.get_by_index(name, &index, &value))
            .await
    }

    /// Documents with `low <= key <= high` on the given index.
    pub async fn get_by_range(
        &self,
        collection: &str,
        index: &str,
        low: &Value,
        high: &Value,
    ) -> Result<Vec<Value>> {
        let index = index.to_string();
        let (low, high) = (low.clone(), high.clone());
        self.read(collection, move |tx, name| {
            tx.get_by_range(name, &index, &low, &high)
        })
        .await
    }

    pub async fn put(&self, collection: &str, document: &Value) -> Result<String> {
        let document = document.clone();
        self.write(collection, move |tx, name| tx.put(name, &document))
            .await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.write(collection, move |tx, name| tx.delete(name, &id)).await
    }

    /// Upsert several documents atomically.
    pub async fn put_many(&self, collection: &str, documents: &[Value]) -> Result<Vec<String>> {
        let documents = documents.to_vec();
        self.write(collection, move |tx, name| {
            documents
                .iter()
                .map(|document| tx.put(name, document))
                .collect()
        })
        .await
    }

    /// Delete several documents atomically. Returns how many existed.
    pub async fn delete_many(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let ids = ids.to_vec();
        self.write(collection, move |tx, name| {
            let mut removed = 0;
            for id in &ids {
                if tx.delete(name, id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        self.read(collection, |tx, name| tx.count(name)).await
    }

    pub async fn clear(&self, collection: &str) -> Result<usize> {
        self.write(collection, |tx, name| tx.clear(name)).await
    }

    /// Cursor-based pagination; only one page is materialized at a time.
    pub async fn paginate(&self, collection: &str, request: &PageRequest) -> Result<Page> {
        if request.limit == 0 {
            return Err(Error::ValidationFailed("page limit must be positive".into()));
        }
        let page = request.clone();
        let mut items = self
            .read(collection, move |tx, name| {
                tx.page(
                    name,
                    page.index.as_deref(),
                    page.cursor.as_deref(),
                    page.limit + 1,
                    page.offset,
                )
            })
            .await?;
        let has_more = items.len() > request.limit;
        items.truncate(request.limit);
        let cursor = if has_more {
            items
                .last()
                .and_then(|item| item.get("id"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        } else {
            None
        };
        Ok(Page {
            items,
            has_more,
            cursor,
        })
    }

    /// Every collection, for backups.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let names = self.schema.names();
        let scope: Vec<&str> = names.iter().map(String::as_str).collect();
        let collections = names.clone();
        self.transaction(&scope, TransactionMode::ReadOnly, move |tx| {
            collections
                .iter()
                .map(|name| Ok((name.clone(), tx.get_all(name)?)))
                .collect()
        })
        .await
    }

    /// Replace every collection named in `snapshot` with its content, atomically.
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let names: Vec<&str> = snapshot.keys().map(String::as_str).collect();
        let snapshot = snapshot.clone();
        self.transaction(&names, TransactionMode::ReadWrite, move |tx| {
            for (name, documents) in &snapshot {
                tx.clear(name)?;
                for document in documents {
                    tx.put(name, document)?;
                }
            }
            Ok(())
        })
        .await
    }
}

/// Run blocking `SQLite` work off the async worker threads.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(error) => Err(Error::Aborted(format!("store task: {error}"))),
    }
}

/// A panicking transaction body has already rolled back, so the connection
/// stays usable.
fn lock(slot: &Mutex<Option<Connection>>) -> std::sync::MutexGuard<'_, Option<Connection>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configure `SQLite` for optimal performance
fn configure(conn: &Connection) -> Result<()> {
    // WAL is unavailable for in-memory databases; ignore the failure there.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .ok();
    conn.execute_batch("PRAGMA synchronous = NORMAL;").ok();
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch("PRAGMA cache_size = 10000;").ok();
    Ok(())
}

/// Create missing collection tables and indexes.
///
/// Returns the names of created objects, so opening a store written by an
/// older version (fewer declared indexes) upgrades it in place.
fn upgrade_indexes(conn: &mut Connection, schema: &StoreSchema) -> Result<Vec<String>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut created = Vec::new();

    for collection in schema.collections() {
        let table_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [&collection.name],
            |row| row.get(0),
        )?;
        if !table_exists {
            tx.execute_batch(&format!(
                "CREATE TABLE \"{}\" (id TEXT PRIMARY KEY NOT NULL, data TEXT NOT NULL)",
                collection.name
            ))?;
            created.push(collection.name.clone());
        }

        for index in &collection.indexes {
            let sql_name = index.sql_name(&collection.name);
            let index_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
                [&sql_name],
                |row| row.get(0),
            )?;
            if index_exists {
                continue;
            }
            if table_exists {
                tracing::info!(
                    "Upgrading collection '{}': adding index '{}'",
                    collection.name,
                    index.name
                );
            }
            tx.execute_batch(&format!(
                "CREATE {}INDEX \"{sql_name}\" ON \"{}\" ({})",
                if index.unique { "UNIQUE " } else { "" },
                collection.name,
                index.expressions().join(", ")
            ))
            .map_err(|error| {
                Error::Schema(format!(
                    "failed to create index '{}' on '{}': {error}",
                    index.name, collection.name
                ))
            })?;
            created.push(format!("{}.{}", collection.name, index.name));
        }
    }

    tx.commit()?;
    Ok(created)
}
