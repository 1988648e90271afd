use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{PaneId, SessionId, WindowId};

/// Pane lifecycle status.
///
/// Records are soft-marked with a terminal status before removal so late
/// readers observe `Exited`/`Killed` rather than a vanished record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaneStatus {
    Spawning,
    Running,
    Exited,
    Killed,
    Error,
}

impl PaneStatus {
    /// True once the pane can no longer produce output.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaneStatus::Exited | PaneStatus::Killed | PaneStatus::Error)
    }
}

impl std::fmt::Display for PaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaneStatus::Spawning => "spawning",
            PaneStatus::Running => "running",
            PaneStatus::Exited => "exited",
            PaneStatus::Killed => "killed",
            PaneStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Window layout descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    EvenHorizontal,
    EvenVertical,
    MainVertical,
    Tiled,
    Custom(String),
}

impl Default for Layout {
    fn default() -> Self {
        Layout::EvenHorizontal
    }
}

/// Split direction for `split_pane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitOrientation {
    Horizontal,
    Vertical,
}

/// Pane dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneSize {
    pub rows: u16,
    pub cols: u16,
}

impl PaneSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Reject zero or over-max dimensions without touching any state.
    pub fn validate(&self, max: u16) -> Result<()> {
        if self.rows == 0 || self.cols == 0 || self.rows > max || self.cols > max {
            return Err(Error::InvalidSize {
                rows: self.rows,
                cols: self.cols,
                max,
            });
        }
        Ok(())
    }
}

impl Default for PaneSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Top-level workspace grouping of windows and panes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub windows: Vec<WindowId>,
    pub version: u64,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), name)
    }

    /// Build a record around an id another component already assigned
    /// (backends hand out the session id they will answer to).
    pub fn with_id(id: SessionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_at: Utc::now(),
            windows: Vec::new(),
            version: 0,
        }
    }
}

/// Layout container grouping panes within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: WindowId,
    pub session_id: SessionId,
    pub layout: Layout,
    pub panes: Vec<PaneId>,
    pub version: u64,
}

impl WindowRecord {
    pub fn new(session_id: SessionId, layout: Layout) -> Self {
        Self {
            id: WindowId::new(),
            session_id,
            layout,
            panes: Vec::new(),
            version: 0,
        }
    }
}

/// A single interactive process and its pseudo-terminal.
///
/// `handle` is the backend-specific opaque identifier (a tmux pane id, an
/// internal counter, ...). It is only unique among live panes of one
/// backend; `id` is the stable engine-assigned identity. `version` is
/// bumped on every mutation and checked on conditional updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaneRecord {
    pub id: PaneId,
    pub session_id: SessionId,
    pub window_id: WindowId,
    pub handle: String,
    pub working_dir: PathBuf,
    pub command: String,
    pub size: PaneSize,
    pub status: PaneStatus,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl PaneRecord {
    pub fn new(
        id: PaneId,
        session_id: SessionId,
        window_id: WindowId,
        handle: impl Into<String>,
        working_dir: PathBuf,
        command: impl Into<String>,
        size: PaneSize,
    ) -> Self {
        Self {
            id,
            session_id,
            window_id,
            handle: handle.into(),
            working_dir,
            command: command.into(),
            size,
            status: PaneStatus::Spawning,
            created_at: Utc::now(),
            version: 0,
        }
    }
}
