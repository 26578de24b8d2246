//! Decides when sync passes run: user requests, reconnects, a periodic
//! timer and backoff retries. At most one pass is in flight at a time.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::connectivity::ConnectivityStatus;
use crate::error::Error;
use crate::models::AutoResolvePolicy;
use crate::sync::clock::Clock;
use crate::sync::conflicts::ConflictManager;
use crate::sync::processor::{BatchReport, SyncProcessor};

const EVENT_CAPACITY: usize = 64;

/// Outcome of a pass as seen by every caller that joined it
pub type PassResult = std::result::Result<BatchReport, Arc<Error>>;

/// Handle on a running (or finished) pass; cloning joins it
pub type PassHandle = Shared<BoxFuture<'static, PassResult>>;

/// Why a pass was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Reconnect,
    Periodic,
    Retry,
}

impl SyncTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Reconnect => "reconnect",
            Self::Periodic => "periodic",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncEventKind {
    Started,
    Completed,
    Failed,
    RetryScheduled,
    RetryExhausted,
}

/// Published on every scheduler state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub trigger: SyncTrigger,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<BatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
}

impl SyncEvent {
    const fn new(kind: SyncEventKind, trigger: SyncTrigger, timestamp: i64) -> Self {
        Self {
            kind,
            trigger,
            timestamp,
            report: None,
            error: None,
            retry_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub consecutive_failures: u32,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    /// Automatic retries stopped until the next external trigger
    pub retries_exhausted: bool,
}

struct SchedulerState {
    in_flight: Option<(u64, PassHandle)>,
    generation: u64,
    consecutive_failures: u32,
    exhausted: bool,
    last_attempt_at: Option<i64>,
    next_retry_at: Option<i64>,
    online: bool,
    retry_task: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            in_flight: None,
            generation: 0,
            consecutive_failures: 0,
            exhausted: false,
            last_attempt_at: None,
            next_retry_at: None,
            // Without a connectivity feed the network is assumed reachable.
            online: true,
            retry_task: None,
            background: Vec::new(),
        }
    }
}

pub struct SyncScheduler {
    processor: Arc<SyncProcessor>,
    conflicts: Arc<ConflictManager>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    auto_resolve: AutoResolvePolicy,
    events: broadcast::Sender<SyncEvent>,
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    pub fn new(
        processor: Arc<SyncProcessor>,
        conflicts: Arc<ConflictManager>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        auto_resolve: AutoResolvePolicy,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            processor,
            conflicts,
            clock,
            config,
            auto_resolve,
            events,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        SchedulerStatus {
            is_running: state.in_flight.is_some(),
            consecutive_failures: state.consecutive_failures,
            last_attempt_at: state.last_attempt_at,
            next_retry_at: state.next_retry_at,
            retries_exhausted: state.exhausted,
        }
    }

    /// Start a pass, or join the one already running.
    ///
    /// The pass runs on its own task and is never cancelled once started;
    /// dropping the returned handle does not stop it.
    pub fn trigger(self: &Arc<Self>, trigger: SyncTrigger) -> PassHandle {
        let mut state = self.lock();
        if let Some((_, pass)) = &state.in_flight {
            tracing::debug!("Sync pass already running, {trigger} trigger joins it");
            return pass.clone();
        }

        if trigger == SyncTrigger::Retry {
            state.retry_task = None;
        } else {
            if state.exhausted {
                state.exhausted = false;
                state.consecutive_failures = 0;
            }
            if let Some(task) = state.retry_task.take() {
                task.abort();
            }
        }
        state.next_retry_at = None;

        state.generation += 1;
        let generation = state.generation;
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run_pass(generation, trigger).await });
        let pass = async move {
            handle
                .await
                .unwrap_or_else(|error| Err(Arc::new(Error::Aborted(error.to_string()))))
        }
        .boxed()
        .shared();
        state.in_flight = Some((generation, pass.clone()));
        pass
    }

    /// Manual pass, awaited.
    pub async fn sync_now(self: &Arc<Self>) -> PassResult {
        self.trigger(SyncTrigger::Manual).await
    }

    async fn run_pass(self: Arc<Self>, generation: u64, trigger: SyncTrigger) -> PassResult {
        let started_at = self.clock.now_millis();
        self.lock().last_attempt_at = Some(started_at);
        self.emit(SyncEvent::new(SyncEventKind::Started, trigger, started_at));
        tracing::debug!("Sync pass started ({trigger})");

        let result = self.processor.process_pending().await.map_err(Arc::new);

        if result.is_ok() && self.auto_resolve != AutoResolvePolicy::Manual {
            match self.conflicts.resolve_all(self.auto_resolve).await {
                Ok(0) => {}
                Ok(resolved) => {
                    tracing::info!("Auto-resolved {resolved} conflicts ({:?})", self.auto_resolve);
                }
                Err(error) => tracing::warn!("Automatic conflict resolution failed: {error}"),
            }
        }

        let failed = result.as_ref().map_or(true, |report| report.failed > 0);
        let consecutive_failures = {
            let mut state = self.lock();
            if state
                .in_flight
                .as_ref()
                .is_some_and(|(current, _)| *current == generation)
            {
                state.in_flight = None;
            }
            if failed {
                state.consecutive_failures += 1;
            } else {
                state.consecutive_failures = 0;
                state.exhausted = false;
                state.next_retry_at = None;
            }
            state.consecutive_failures
        };

        let now = self.clock.now_millis();
        match &result {
            Ok(report) => {
                let kind = if failed {
                    SyncEventKind::Failed
                } else {
                    SyncEventKind::Completed
                };
                tracing::info!(
                    "Sync pass ({trigger}) finished: {} synced, {} failed, {} conflicts, {} deferred",
                    report.successful,
                    report.failed,
                    report.conflicts,
                    report.deferred
                );
                self.emit(SyncEvent {
                    report: Some(report.clone()),
                    ..SyncEvent::new(kind, trigger, now)
                });
            }
            Err(error) => {
                tracing::warn!("Sync pass ({trigger}) failed: {error}");
                self.emit(SyncEvent {
                    error: Some(error.to_string()),
                    ..SyncEvent::new(SyncEventKind::Failed, trigger, now)
                });
            }
        }

        if failed {
            self.schedule_retry(consecutive_failures, trigger);
        }
        result
    }

    fn schedule_retry(self: &Arc<Self>, consecutive_failures: u32, trigger: SyncTrigger) {
        let now = self.clock.now_millis();
        if consecutive_failures > self.config.max_retries {
            {
                let mut state = self.lock();
                state.exhausted = true;
                state.next_retry_at = None;
            }
            tracing::warn!(
                "Sync failed {consecutive_failures} times in a row, automatic retry stopped"
            );
            self.emit(SyncEvent::new(SyncEventKind::RetryExhausted, trigger, now));
            return;
        }

        let delay = self.config.backoff(consecutive_failures);
        let retry_at = now.saturating_add(millis(delay));
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            scheduler.clock.sleep(delay).await;
            drop(scheduler.trigger(SyncTrigger::Retry));
        });
        {
            let mut state = self.lock();
            if let Some(previous) = state.retry_task.replace(task) {
                previous.abort();
            }
            state.next_retry_at = Some(retry_at);
        }
        tracing::warn!("Sync retry {consecutive_failures} scheduled in {delay:?}");
        self.emit(SyncEvent {
            retry_at: Some(retry_at),
            ..SyncEvent::new(SyncEventKind::RetryScheduled, trigger, now)
        });
    }

    /// Feed a debounced connectivity change.
    ///
    /// Coming back online starts a pass unless one was attempted within the
    /// retry delay.
    pub fn on_connectivity_change(self: &Arc<Self>, online: bool) {
        let now = self.clock.now_millis();
        let quiet_period = millis(self.config.retry_delay());
        let recent = {
            let mut state = self.lock();
            let was_online = std::mem::replace(&mut state.online, online);
            if !online || was_online {
                return;
            }
            state
                .last_attempt_at
                .is_some_and(|at| now.saturating_sub(at) < quiet_period)
        };
        if recent {
            tracing::debug!("Back online, skipping sync: last attempt was too recent");
            return;
        }
        tracing::info!("Back online, starting sync");
        drop(self.trigger(SyncTrigger::Reconnect));
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Spawn the periodic timer and, when given, follow connectivity changes.
    pub fn start(self: &Arc<Self>, connectivity: Option<watch::Receiver<ConnectivityStatus>>) {
        self.stop();
        let mut tasks = Vec::new();

        if let Some(mut updates) = connectivity {
            self.lock().online = updates.borrow_and_update().online;
            let scheduler = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                while updates.changed().await.is_ok() {
                    let online = updates.borrow_and_update().online;
                    scheduler.on_connectivity_change(online);
                }
            }));
        }

        if let Some(interval) = self.config.periodic_interval() {
            let scheduler = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    scheduler.clock.sleep(interval).await;
                    if scheduler.is_online() {
                        drop(scheduler.trigger(SyncTrigger::Periodic));
                    }
                }
            }));
        }

        tracing::debug!("Sync scheduler started with {} background tasks", tasks.len());
        self.lock().background = tasks;
    }

    /// Stop timers and pending retries; a running pass finishes on its own.
    pub fn stop(&self) {
        let mut state = self.lock();
        for task in state.background.drain(..) {
            task.abort();
        }
        if let Some(task) = state.retry_task.take() {
            task.abort();
        }
        state.next_retry_at = None;
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        self.events.send(event).ok();
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::HABITS;
    use crate::db::{default_schema, Store};
    use crate::models::{EntityKind, Habit, OperationType, Record, SyncOperation};
    use crate::sync::clock::ManualClock;
    use crate::sync::queue::SyncQueue;
    use crate::test_support::FakeRemote;
    use crate::config::SyncConfig;
    use pretty_assertions::assert_eq;

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<SyncQueue>,
        store: Arc<Store>,
        remote: Arc<FakeRemote>,
        scheduler: Arc<SyncScheduler>,
    }

    async fn setup(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(Store::open_in_memory(default_schema()).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let queue = Arc::new(SyncQueue::new(store.clone(), dyn_clock.clone()));
        let conflicts = Arc::new(ConflictManager::new(
            store.clone(),
            queue.clone(),
            dyn_clock.clone(),
        ));
        let remote = Arc::new(FakeRemote::default());
        let processor = Arc::new(SyncProcessor::new(
            store.clone(),
            queue.clone(),
            conflicts.clone(),
            remote.clone(),
            dyn_clock.clone(),
            SyncConfig::default(),
        ));
        let scheduler = SyncScheduler::new(
            processor,
            conflicts,
            dyn_clock,
            config,
            AutoResolvePolicy::ServerWins,
        );
        Fixture {
            clock,
            queue,
            store,
            remote,
            scheduler,
        }
    }

    async fn queue_habit(fixture: &Fixture, name: &str) {
        let record = Record::new_local(Habit::new(name), 1_000);
        fixture
            .store
            .put(HABITS, &record.to_document().unwrap())
            .await
            .unwrap();
        fixture
            .queue
            .enqueue(
                SyncOperation::new(
                    OperationType::Create,
                    EntityKind::Habit,
                    record.id(),
                    record.payload().unwrap(),
                )
                .with_entity_version(1),
            )
            .await
            .unwrap();
    }

    async fn settle(clock: &ManualClock) {
        while clock.sleepers() == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_retry_delay(Duration::from_secs(1))
            .without_periodic_sync()
    }

    #[tokio::test]
    async fn concurrent_triggers_share_one_pass() {
        let fixture = setup(config()).await;
        queue_habit(&fixture, "Exercise").await;
        fixture.remote.hold();

        let first = fixture.scheduler.trigger(SyncTrigger::Manual);
        let second = fixture.scheduler.trigger(SyncTrigger::Manual);
        while fixture.remote.create_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(fixture.scheduler.status().is_running);
        fixture.remote.release();

        let (first, second) = tokio::join!(first, second);
        let first = first.unwrap();
        assert_eq!(first, second.unwrap());
        assert_eq!(first.successful, 1);
        assert_eq!(fixture.remote.create_calls(), 1);
        assert!(!fixture.scheduler.status().is_running);
    }

    #[tokio::test]
    async fn retries_stop_after_max_consecutive_failures() {
        let fixture = setup(config().with_max_retries(2)).await;
        queue_habit(&fixture, "Read").await;
        fixture.remote.set_offline(true);
        let mut events = fixture.scheduler.subscribe();

        let report = fixture.scheduler.sync_now().await.unwrap();
        assert_eq!(report.network_errors, 1);

        let mut passes = 0;
        loop {
            let event = events.recv().await.unwrap();
            match event.kind {
                SyncEventKind::Started => passes += 1,
                SyncEventKind::RetryScheduled => {
                    assert!(event.retry_at.is_some());
                    settle(&fixture.clock).await;
                    fixture.clock.advance(Duration::from_secs(60));
                }
                SyncEventKind::RetryExhausted => break,
                SyncEventKind::Completed | SyncEventKind::Failed => {}
            }
        }
        assert_eq!(passes, 3);
        assert_eq!(fixture.remote.create_calls(), 3);
        let status = fixture.scheduler.status();
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.retries_exhausted);
        assert_eq!(status.next_retry_at, None);

        // A user action starts over.
        fixture.remote.set_offline(false);
        let report = fixture.scheduler.sync_now().await.unwrap();
        assert_eq!(report.successful, 1);
        let status = fixture.scheduler.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(!status.retries_exhausted);
    }

    #[tokio::test]
    async fn reconnect_is_ignored_right_after_an_attempt() {
        let fixture = setup(config()).await;
        fixture.scheduler.sync_now().await.unwrap();
        let mut events = fixture.scheduler.subscribe();

        fixture.scheduler.on_connectivity_change(false);
        fixture.scheduler.on_connectivity_change(true);
        assert!(!fixture.scheduler.status().is_running);

        fixture.clock.advance(Duration::from_secs(10));
        fixture.scheduler.on_connectivity_change(false);
        fixture.scheduler.on_connectivity_change(true);
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, SyncEventKind::Started);
        assert_eq!(event.trigger, SyncTrigger::Reconnect);
    }

    #[tokio::test]
    async fn periodic_timer_runs_while_online() {
        let fixture = setup(config().with_periodic_interval(Duration::from_secs(30))).await;
        let mut events = fixture.scheduler.subscribe();
        fixture.scheduler.start(None);

        settle(&fixture.clock).await;
        fixture.clock.advance(Duration::from_secs(30));
        let event = events.recv().await.unwrap();
        assert_eq!(event.trigger, SyncTrigger::Periodic);
        fixture.scheduler.stop();
    }
}
