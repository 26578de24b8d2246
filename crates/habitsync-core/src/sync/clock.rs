//! Time source for timers, debouncing and retry scheduling

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::util::unix_millis_now;

/// Source of wall-clock time and timers.
///
/// Everything that waits (retry backoff, periodic sync, connectivity
/// debounce) goes through this so it can be driven by [`ManualClock`] in tests.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current time as unix milliseconds
    fn now_millis(&self) -> i64;

    async fn sleep(&self, duration: Duration);
}

/// Real time backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        unix_millis_now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: i64,
    sleepers: Vec<(i64, oneshot::Sender<()>)>,
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                sleepers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += millis(duration);
        let now = state.now;
        let (due, waiting): (Vec<_>, Vec<_>) = state
            .sleepers
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        state.sleepers = waiting;
        drop(state);
        for (_, waker) in due {
            waker.send(()).ok();
        }
    }

    /// Number of tasks currently blocked in [`Clock::sleep`].
    pub fn sleepers(&self) -> usize {
        let mut state = self.lock();
        state.sleepers.retain(|(_, waker)| !waker.is_closed());
        state.sleepers.len()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let receiver = {
            let mut state = self.lock();
            let deadline = state.now + millis(duration);
            let (sender, receiver) = oneshot::channel();
            state.sleepers.push((deadline, sender));
            receiver
        };
        receiver.await.ok();
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_at_deadline() {
        let clock = Arc::new(ManualClock::new(1_000));
        let sleeper = {
            let clock = Arc::clone(&clock);
            tokio::spawn(async move {
                clock.sleep(Duration::from_millis(500)).await;
                clock.now_millis()
            })
        };
        while clock.sleepers() == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_millis(499));
        assert_eq!(clock.sleepers(), 1);
        clock.advance(Duration::from_millis(1));
        assert_eq!(sleeper.await.unwrap(), 1_500);
        assert_eq!(clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn zero_sleep_returns_immediately() {
        let clock = ManualClock::new(0);
        clock.sleep(Duration::ZERO).await;
        assert_eq!(clock.now_millis(), 0);
    }
}
