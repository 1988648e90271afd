use std::time::Duration;

use thiserror::Error;

use crate::ids::PaneId;

/// Result alias used across the panemux crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the whole engine.
///
/// Every variant is programmatically distinguishable and carries the entity
/// id and operation context needed by callers to decide policy. Backends and
/// stores map their internal failures into these variants at the boundary;
/// raw backend errors never cross it.
#[derive(Debug, Error)]
pub enum Error {
    /// The executable could not be resolved or the OS denied PTY creation.
    #[error("failed to spawn process: {message}")]
    Spawn { message: String },

    /// A write or resize was attempted after the pane's process exited.
    #[error("channel '{channel}' closed for pane {id}")]
    ChannelClosed { id: PaneId, channel: &'static str },

    /// Zero or over-max dimensions. State is left unchanged.
    #[error("invalid size {rows}x{cols}: dimensions must be positive and at most {max}")]
    InvalidSize { rows: u16, cols: u16, max: u16 },

    /// A backend operation failed. `message` is human-readable context,
    /// never raw multiplexer output handed through verbatim.
    #[error("{backend_kind} backend failed during {operation}: {message}")]
    Backend {
        operation: &'static str,
        backend_kind: &'static str,
        message: String,
    },

    /// An external multiplexer call exceeded the configured deadline.
    #[error("backend operation '{operation}' timed out after {timeout:?}")]
    BackendTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Optimistic-concurrency rejection: the caller's base version is stale.
    #[error("stale write to {entity}: expected version {expected}, current version {actual}")]
    Conflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    /// The target entity does not exist (or was already removed).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A storage backend failed. Fatal to the mutation in flight only;
    /// previously committed state is never corrupted.
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl Error {
    pub fn spawn(message: impl Into<String>) -> Self {
        Error::Spawn {
            message: message.into(),
        }
    }

    pub fn backend(
        operation: &'static str,
        backend_kind: &'static str,
        message: impl ToString,
    ) -> Self {
        Error::Backend {
            operation,
            backend_kind,
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn storage(message: impl ToString) -> Self {
        Error::Storage {
            message: message.to_string(),
        }
    }

    /// True for errors a caller may safely retry on a read-only operation.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::BackendTimeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::storage(err)
    }
}
