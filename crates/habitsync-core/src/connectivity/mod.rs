//! Connectivity monitoring: reachability, link quality and trend

mod sensor;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use sensor::{HttpSensor, LinkType, NetworkSensor};

use crate::config::ConnectivityConfig;
use crate::error::Result;
use crate::sync::clock::Clock;

const LATENCY_WEIGHT: f64 = 0.5;
const LINK_WEIGHT: f64 = 0.2;
const THROUGHPUT_WEIGHT: f64 = 0.3;

const EXCELLENT_THRESHOLD: f64 = 0.75;
const GOOD_THRESHOLD: f64 = 0.4;

/// Latency at or below this scores 1.0
const FAST_LATENCY_MS: f64 = 100.0;
/// Latency at or above this scores 0.0
const SLOW_LATENCY_MS: f64 = 1_000.0;
/// Throughput at or above this (kbps) scores 1.0
const FULL_THROUGHPUT_KBPS: f64 = 5_000.0;

const TREND_DELTA: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Poor,
    Good,
    Excellent,
}

impl Quality {
    pub fn from_score(score: f64) -> Self {
        if score >= EXCELLENT_THRESHOLD {
            Self::Excellent
        } else if score >= GOOD_THRESHOLD {
            Self::Good
        } else {
            Self::Poor
        }
    }
}

/// Published connectivity state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub online: bool,
    pub quality: Quality,
    pub last_online: Option<i64>,
    pub last_offline: Option<i64>,
}

/// One quality assessment; absent signals failed or timed out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub timestamp: i64,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub link_type: Option<LinkType>,
    pub throughput_kbps: Option<f64>,
    pub score: f64,
    pub quality: Quality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Weighted quality score; a missing signal contributes nothing.
pub fn quality_score(
    latency: Option<Duration>,
    link_type: Option<LinkType>,
    throughput_kbps: Option<f64>,
) -> f64 {
    let latency_score = latency.map_or(0.0, |latency| {
        let millis = latency.as_secs_f64() * 1000.0;
        (1.0 - (millis - FAST_LATENCY_MS) / (SLOW_LATENCY_MS - FAST_LATENCY_MS)).clamp(0.0, 1.0)
    });
    let link_score = link_type.map_or(0.0, LinkType::score);
    let throughput_score =
        throughput_kbps.map_or(0.0, |kbps| (kbps / FULL_THROUGHPUT_KBPS).clamp(0.0, 1.0));
    LATENCY_WEIGHT * latency_score + LINK_WEIGHT * link_score + THROUGHPUT_WEIGHT * throughput_score
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<QualitySample>,
    /// Bumped on every raw observation that changes the pending target
    generation: u64,
    pending: Option<bool>,
    task: Option<JoinHandle<()>>,
}

/// Observes reachability and link quality and publishes a debounced status.
pub struct ConnectivityMonitor {
    sensor: Arc<dyn NetworkSensor>,
    clock: Arc<dyn Clock>,
    config: ConnectivityConfig,
    status: watch::Sender<ConnectivityStatus>,
    state: Mutex<MonitorState>,
}

impl ConnectivityMonitor {
    /// New monitor; starts offline until a sample says otherwise.
    pub fn new(
        sensor: Arc<dyn NetworkSensor>,
        clock: Arc<dyn Clock>,
        config: ConnectivityConfig,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectivityStatus::default());
        Arc::new(Self {
            sensor,
            clock,
            config,
            status,
            state: Mutex::new(MonitorState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.status.subscribe()
    }

    /// Feed a raw reachability observation through the debounce window.
    ///
    /// A change is published only if it still holds once the window elapses;
    /// flapping back to the published state inside the window cancels it.
    pub fn report_reachability(self: &Arc<Self>, online: bool) {
        let published = self.status.borrow().online;
        let mut state = self.lock();
        if state.pending == Some(online) {
            return;
        }
        state.generation += 1;
        if online == published {
            state.pending = None;
            return;
        }
        state.pending = Some(online);
        let generation = state.generation;
        drop(state);

        let debounce = self.config.debounce();
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            monitor.clock.sleep(debounce).await;
            let mut state = monitor.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            drop(state);
            monitor.publish(online);
        });
    }

    fn publish(&self, online: bool) {
        let now = self.clock.now_millis();
        let assessed = self.lock().history.back().map(|sample| sample.quality);
        self.status.send_if_modified(|status| {
            if status.online == online {
                return false;
            }
            status.online = online;
            if online {
                status.last_online = Some(now);
                status.quality = assessed.unwrap_or(Quality::Good);
            } else {
                status.last_offline = Some(now);
                status.quality = Quality::Poor;
            }
            true
        });
        if online {
            tracing::info!("Connectivity restored");
        } else {
            tracing::warn!("Connectivity lost");
        }
    }

    /// Sample every signal, record the result and update the status.
    pub async fn check_now(self: &Arc<Self>) -> QualitySample {
        let timeout = self.config.reachability_timeout();
        let (reachable, latency, link_type, throughput) = futures::join!(
            bounded(timeout, self.sensor.check_reachable()),
            bounded(timeout, self.sensor.measure_latency()),
            bounded(timeout, self.sensor.link_type()),
            bounded(timeout, self.sensor.measure_throughput()),
        );
        let reachable = reachable.unwrap_or(false);
        let score = if reachable {
            quality_score(latency, link_type, throughput)
        } else {
            0.0
        };
        let sample = QualitySample {
            timestamp: self.clock.now_millis(),
            reachable,
            latency_ms: latency.map(|latency| u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            link_type,
            throughput_kbps: throughput,
            score,
            quality: Quality::from_score(score),
        };
        tracing::debug!(
            "Connectivity sample: reachable={} score={:.2} quality={:?}",
            sample.reachable,
            sample.score,
            sample.quality
        );

        self.record_sample(sample.clone());
        self.report_reachability(reachable);
        sample
    }

    fn record_sample(&self, sample: QualitySample) {
        let quality = sample.quality;
        let mut state = self.lock();
        state.history.push_back(sample);
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
        drop(state);
        self.status.send_if_modified(|status| {
            if status.online && status.quality != quality {
                status.quality = quality;
                true
            } else {
                false
            }
        });
    }

    /// Recent samples, oldest first.
    pub fn history(&self) -> Vec<QualitySample> {
        self.lock().history.iter().cloned().collect()
    }

    /// Compare the newer half of the history with the older half.
    pub fn trend(&self) -> Trend {
        let state = self.lock();
        let scores: Vec<f64> = state.history.iter().map(|sample| sample.score).collect();
        drop(state);
        if scores.len() < 4 {
            return Trend::Stable;
        }
        let (older, newer) = scores.split_at(scores.len() / 2);
        let delta = mean(newer) - mean(older);
        if delta > TREND_DELTA {
            Trend::Improving
        } else if delta < -TREND_DELTA {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }

    /// Sample every `check_interval` until stopped.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let interval = self.config.check_interval();
        let task = tokio::spawn(async move {
            loop {
                monitor.check_now().await;
                monitor.clock.sleep(interval).await;
            }
        });
        if let Some(previous) = self.lock().task.replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock().task.take() {
            task.abort();
        }
    }
}

async fn bounded<T>(timeout: Duration, sample: impl Future<Output = Result<T>>) -> Option<T> {
    match tokio::time::timeout(timeout, sample).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            tracing::debug!("Connectivity check failed: {error}");
            None
        }
        Err(_) => {
            tracing::debug!("Connectivity check timed out after {timeout:?}");
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
