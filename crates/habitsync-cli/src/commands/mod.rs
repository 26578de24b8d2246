pub mod backup;
pub mod common;
pub mod completions;
pub mod conflicts;
pub mod entry;
pub mod habit;
pub mod integrity;
pub mod migrate;
pub mod status;
pub mod sync;
