//! Outbox, remote calls, conflict handling and pass scheduling

pub mod clock;
pub mod conflicts;
pub mod processor;
pub mod queue;
pub mod remote;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflicts::{auto_resolution, ConflictManager, ConflictMerger, MergeSide, OverlayMerger};
pub use processor::{BatchReport, OperationOutcome, OperationReport, SyncProcessor, LAST_SYNC_KEY};
pub use queue::SyncQueue;
pub use remote::{HttpRemoteApi, RemoteApi, ToggleRequest};
pub use scheduler::{
    PassHandle, PassResult, SchedulerStatus, SyncEvent, SyncEventKind, SyncScheduler, SyncTrigger,
};
