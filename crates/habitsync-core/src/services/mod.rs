//! Client-facing services built on the store and sync layers.

mod engine;

pub use engine::{EngineBuilder, HabitSyncEngine};
