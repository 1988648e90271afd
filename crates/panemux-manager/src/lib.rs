//! Composition root: translates external actions into coordinated backend
//! and state-manager calls, and exposes the event bus to callers.
//!
//! This is the only crate consumers need to depend on; the building blocks
//! are re-exported for convenience.

mod manager;

pub use manager::TerminalManager;

pub use panemux_backend::{BackendKind, MockBackend, PaneSpec, TerminalBackend};
pub use panemux_events::{BusSubscriber, Capability, EventBus, OverflowPolicy, Plugin};
pub use panemux_state::{JsonFileStore, MemoryStore, Snapshot, SqliteStore, StateStore};
pub use panemux_types::{
    CloseReason, Config, Error, Event, Layout, PaneId, PaneRecord, PaneSize, PaneStatus,
    Result, SessionId, SessionRecord, SplitOrientation, WindowId, WindowRecord,
};
