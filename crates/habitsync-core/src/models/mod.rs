//! Data models for habitsync

mod conflict;
mod entry;
mod habit;
mod record;
mod sync_operation;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use conflict::{AutoResolvePolicy, ConflictRecord, RemoteRecord, Resolution};
pub use entry::{EntryUpdate, HabitEntry, HabitEntryRecord, MAX_NOTE_LEN};
pub use habit::{Habit, HabitRecord, HabitUpdate, MAX_DESCRIPTION_LEN, MAX_NAME_LEN};
pub use record::{domain_fields, EntityKind, Record, SyncMeta, META_FIELDS};
pub use sync_operation::{OperationStatus, OperationType, SyncOperation, DEFAULT_MAX_RETRIES};

use crate::error::Result;

/// Domain value that can be stored and synchronized.
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Normalize in place and reject malformed input.
    fn validate(&mut self) -> Result<()>;

    /// Key used to detect duplicate records of the same domain object.
    fn domain_key(&self) -> String;

    /// Id of the owning habit, for child entities.
    fn parent_id(&self) -> Option<&str>;
}
