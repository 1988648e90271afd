//! Core types shared across the panemux crates.
//!
//! This crate provides the id newtypes, session/window/pane records, the
//! event taxonomy, the error taxonomy, and engine configuration used by
//! every other panemux crate.

mod config;
mod error;
mod event;
mod ids;
mod record;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{CloseReason, Event, RecordKind, ResourceKind};
pub use ids::{PaneId, SessionId, WindowId};
pub use record::{
    Layout, PaneRecord, PaneSize, PaneStatus, SessionRecord, SplitOrientation, WindowRecord,
};

// Constants
pub const DEFAULT_MAX_DIMENSION: u16 = 1000;
pub const DEFAULT_SCROLLBACK_LINES: usize = 10_000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
pub const DEFAULT_LIVENESS_POLL_MS: u64 = 5_000;
pub const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;
pub const MAX_CONCURRENT_SESSIONS: usize = 15;
