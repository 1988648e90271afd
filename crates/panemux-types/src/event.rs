use serde::{Deserialize, Serialize};

use crate::ids::{PaneId, SessionId, WindowId};
use crate::record::PaneSize;

/// Why a pane stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// The process exited on its own.
    Exited,
    /// The pane was killed through the engine.
    Killed,
    /// The pane failed (spawn error, I/O error, backend loss).
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::Exited => "exited",
            CloseReason::Killed => "killed",
            CloseReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Entity kind for record-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Session,
    Window,
    Pane,
}

/// Resource pressure categories reported via `Event::ResourceWarning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceKind {
    SubscriberQueue,
    Scrollback,
    SessionLimit,
}

/// Events published on the bus.
///
/// The taxonomy is extensible; consumers must tolerate unknown variants by
/// matching with a wildcard arm. Late subscribers never receive past events.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    SessionCreated {
        session_id: SessionId,
        name: String,
    },
    SessionKilled {
        session_id: SessionId,
    },
    PaneCreated {
        session_id: SessionId,
        window_id: WindowId,
        pane_id: PaneId,
    },
    PaneOutput {
        pane_id: PaneId,
        bytes: Vec<u8>,
    },
    PaneResized {
        pane_id: PaneId,
        size: PaneSize,
    },
    PaneClosed {
        pane_id: PaneId,
        reason: CloseReason,
    },
    /// A state-manager mutation committed. `value` is the record's new
    /// serialized form, `None` when the record was removed.
    RecordChanged {
        kind: RecordKind,
        id: String,
        version: u64,
        value: Option<serde_json::Value>,
    },
    ResourceWarning {
        kind: ResourceKind,
        detail: String,
    },
}

impl Event {
    /// Stable event name, used for logging and plugin filtering.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionCreated { .. } => "session_created",
            Event::SessionKilled { .. } => "session_killed",
            Event::PaneCreated { .. } => "pane_created",
            Event::PaneOutput { .. } => "pane_output",
            Event::PaneResized { .. } => "pane_resized",
            Event::PaneClosed { .. } => "pane_closed",
            Event::RecordChanged { .. } => "record_changed",
            Event::ResourceWarning { .. } => "resource_warning",
        }
    }
}
