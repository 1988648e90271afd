//! State manager: the authoritative, durable record of sessions, windows,
//! and panes, independent of backend liveness.
//!
//! Mutations are transactional: applied to the in-memory tables and
//! journaled to the store before the call returns, or not applied at all.
//! Full snapshots are flushed on an interval (journal compaction); the
//! journal guarantees no acknowledged mutation is ever lost in between.

mod manager;
mod snapshot;
mod store;

pub use manager::StateManager;
pub use snapshot::{Snapshot, SCHEMA_VERSION};
pub use store::{JournalEntry, JsonFileStore, MemoryStore, SqliteStore, StateStore};
