//! Local store, schema evolution and integrity tooling

mod backup;
mod connection;
mod integrity;
mod migrations;
pub mod schema;
mod transaction;

pub use backup::{Backup, BackupInfo, BackupManager};
pub use connection::{Page, PageRequest, Snapshot, Store};
pub use integrity::{
    IntegrityChecker, IntegrityIssue, IntegrityOptions, IntegrityReport, IntegrityStatus,
    IssueKind, RecoveryReport, Severity,
};
pub use migrations::{
    builtin_migrations, Migration, MigrationStatus, Migrator, SCHEMA_VERSION_KEY,
};
pub use schema::{default_schema, CollectionSchema, IndexSpec, StoreSchema};
pub use transaction::{StoreTransaction, TransactionMode};
