//! In-memory remote for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::models::{EntityKind, RemoteRecord};
use crate::sync::remote::{RemoteApi, ToggleRequest};

#[derive(Default)]
struct State {
    next_id: u64,
    records: HashMap<String, RemoteRecord>,
    entries: HashMap<(String, String), String>,
    failures: VecDeque<Error>,
    diverged: HashMap<String, RemoteRecord>,
    offline: bool,
}

/// Remote that stores records in memory, with scripted failures.
pub struct FakeRemote {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    toggles: AtomicUsize,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            gate: watch::channel(true).0,
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            toggles: AtomicUsize::new(0),
        }
    }
}

impl FakeRemote {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// The next call fails with `error`.
    pub fn fail_next(&self, error: Error) {
        self.state().failures.push_back(error);
    }

    /// Every call fails with a network error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Next update of `server_id` answers with this server-side state instead.
    pub fn diverge(&self, server_id: &str, data: Value, version: u64) {
        self.state().diverged.insert(
            server_id.to_string(),
            RemoteRecord {
                server_id: server_id.to_string(),
                version,
                last_modified: 0,
                data,
            },
        );
    }

    /// Block calls until [`FakeRemote::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn toggle_calls(&self) -> usize {
        self.toggles.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.create_calls() + self.update_calls() + self.delete_calls() + self.toggle_calls()
    }

    pub fn record(&self, server_id: &str) -> Option<RemoteRecord> {
        self.state().records.get(server_id).cloned()
    }

    async fn enter(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await.ok();
        let mut state = self.state();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if state.offline {
            return Err(Error::NetworkFailure("connection refused".into()));
        }
        Ok(())
    }

    fn insert(&self, prefix: &str, data: Value) -> RemoteRecord {
        let mut state = self.state();
        state.next_id += 1;
        let record = RemoteRecord {
            server_id: format!("{prefix}_{}", state.next_id),
            version: 1,
            last_modified: 0,
            data,
        };
        state.records.insert(record.server_id.clone(), record.clone());
        record
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create_entity(&self, kind: EntityKind, payload: &Value) -> Result<RemoteRecord> {
        self.enter(&self.creates).await?;
        Ok(self.insert(kind.as_str(), payload.clone()))
    }

    async fn update_entity(
        &self,
        _kind: EntityKind,
        server_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord> {
        self.enter(&self.updates).await?;
        let mut state = self.state();
        if let Some(diverged) = state.diverged.remove(server_id) {
            state.records.insert(server_id.to_string(), diverged.clone());
            return Ok(diverged);
        }
        let record = state
            .records
            .get_mut(server_id)
            .ok_or_else(|| Error::Remote {
                status: 404,
                message: format!("{server_id} not found"),
            })?;
        record.version += 1;
        record.data = payload.clone();
        Ok(record.clone())
    }

    async fn delete_entity(&self, _kind: EntityKind, server_id: &str) -> Result<()> {
        self.enter(&self.deletes).await?;
        self.state().records.remove(server_id);
        Ok(())
    }

    async fn toggle_completion(&self, request: &ToggleRequest) -> Result<Option<RemoteRecord>> {
        self.enter(&self.toggles).await?;
        let key = (request.habit_id.clone(), request.date.clone());
        let data = json!({
            "habitId": request.habit_id,
            "date": request.date,
            "completed": request.completed,
            "note": request.note,
        });
        let existing = self.state().entries.get(&key).cloned();
        match (request.completed, existing) {
            (false, None) => Ok(None),
            (_, Some(server_id)) => {
                let mut state = self.state();
                let record = state
                    .records
                    .get_mut(&server_id)
                    .ok_or_else(|| Error::NotFound(server_id.clone()))?;
                record.version += 1;
                record.data = data;
                Ok(Some(record.clone()))
            }
            (true, None) => {
                let record = self.insert("entry", data);
                self.state().entries.insert(key, record.server_id.clone());
                Ok(Some(record))
            }
        }
    }
}
