//! Sync state summary shown to clients.

use serde::{Deserialize, Serialize};

use crate::connectivity::Quality;
use crate::sync::SchedulerStatus;

/// Coarse sync state for status indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    /// Local edits are waiting to be sent
    Pending,
    Synced,
    Error,
}

/// Snapshot answered by `HabitSyncEngine::status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub online: bool,
    pub quality: Option<Quality>,
    pub remote_configured: bool,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub unresolved_conflicts: usize,
    pub last_sync_at: Option<i64>,
    pub scheduler: SchedulerStatus,
}

impl SyncStatus {
    /// Derive the coarse state from the counters.
    pub const fn derive_state(&self) -> SyncState {
        if self.scheduler.is_running {
            SyncState::Syncing
        } else if !self.online || !self.remote_configured {
            SyncState::Offline
        } else if self.failed_operations > 0 || self.scheduler.consecutive_failures > 0 {
            SyncState::Error
        } else if self.pending_operations > 0 || self.unresolved_conflicts > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> SyncStatus {
        SyncStatus {
            state: SyncState::Synced,
            online: true,
            quality: None,
            remote_configured: true,
            pending_operations: 0,
            failed_operations: 0,
            unresolved_conflicts: 0,
            last_sync_at: None,
            scheduler: SchedulerStatus::default(),
        }
    }

    #[test]
    fn running_pass_wins_over_everything() {
        let mut status = status();
        status.online = false;
        status.scheduler.is_running = true;
        assert_eq!(status.derive_state(), SyncState::Syncing);
    }

    #[test]
    fn queued_work_is_pending_until_it_fails() {
        let mut status = status();
        assert_eq!(status.derive_state(), SyncState::Synced);
        status.pending_operations = 2;
        assert_eq!(status.derive_state(), SyncState::Pending);
        status.failed_operations = 1;
        assert_eq!(status.derive_state(), SyncState::Error);
        status.online = false;
        assert_eq!(status.derive_state(), SyncState::Offline);
    }
}
