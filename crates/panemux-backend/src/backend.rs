use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use panemux_types::{
    Config, Error, PaneId, PaneSize, Result, SessionId, SplitOrientation, WindowId,
};

/// Session metadata as reported by a backend.
#[derive(Debug, Clone)]
pub struct BackendSessionInfo {
    pub session_id: SessionId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub working_dir: PathBuf,
    pub pane_count: usize,
}

/// Result of creating a session.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
}

/// Result of creating or splitting a pane.
#[derive(Debug, Clone)]
pub struct CreatedPane {
    pub pane_id: PaneId,
    /// Backend-specific opaque handle (tmux `%id`, internal counter, ...).
    /// Unique among this backend's live panes only.
    pub handle: String,
    pub working_dir: PathBuf,
    pub command: String,
    pub size: PaneSize,
}

/// Parameters for `create_pane`. Unset fields fall back to the session's
/// working directory and the default shell.
#[derive(Debug, Clone, Default)]
pub struct PaneSpec {
    pub command: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub size: Option<PaneSize>,
}

/// The multiplexer capability set.
///
/// Every operation is non-blocking at the call boundary and returns a typed
/// result; adapters map their internal failures to `Error::Backend` (or
/// `Error::BackendTimeout`) and never leak partially created resources on
/// failure. Behavior is identical across adapters except where documented
/// (`output_stream`).
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Create a session. The returned id is the engine-wide identity the
    /// backend will accept in subsequent calls.
    async fn create_session(&self, name: &str, cwd: Option<&Path>) -> Result<CreatedSession>;

    async fn list_sessions(&self) -> Result<Vec<BackendSessionInfo>>;

    /// Create a pane in the session. `window` is a placement hint recorded
    /// by the state layer; adapters that have no window concept ignore it.
    async fn create_pane(
        &self,
        session_id: SessionId,
        window: Option<WindowId>,
        spec: &PaneSpec,
    ) -> Result<CreatedPane>;

    /// Split an existing pane. `size_percent` is the share given to the new
    /// pane and must be strictly between 0 and 100; the new pane inherits
    /// the parent's working directory unless the spec overrides it.
    async fn split_pane(
        &self,
        session_id: SessionId,
        pane_id: PaneId,
        orientation: SplitOrientation,
        size_percent: u8,
        spec: &PaneSpec,
    ) -> Result<CreatedPane>;

    async fn send_keys(&self, session_id: SessionId, pane_id: PaneId, keys: &[u8]) -> Result<()>;

    /// Captured output, truncated to the last `max_lines` lines.
    async fn capture_pane(
        &self,
        session_id: SessionId,
        pane_id: PaneId,
        max_lines: usize,
    ) -> Result<String>;

    async fn resize_pane(&self, session_id: SessionId, pane_id: PaneId, size: PaneSize)
        -> Result<()>;

    async fn kill_pane(&self, session_id: SessionId, pane_id: PaneId) -> Result<()>;

    async fn kill_session(&self, session_id: SessionId) -> Result<()>;

    /// Liveness check. Unknown panes are dead, not errors.
    async fn is_pane_alive(&self, pane_id: PaneId) -> bool;

    /// The pane's raw output stream, in production order, ending at process
    /// exit or kill. Streaming adapters hand it out exactly once; adapters
    /// that cannot stream (tmux) return `Ok(None)` and callers fall back to
    /// liveness polling plus `capture_pane`.
    async fn output_stream(&self, pane_id: PaneId) -> Result<Option<mpsc::Receiver<Vec<u8>>>>;

    fn kind(&self) -> BackendKind;
}

/// Which backend strategy to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// External tmux multiplexer.
    Tmux,
    /// In-process PTY engine.
    Local,
    /// Deterministic in-memory mock.
    Mock,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Local
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tmux" => Ok(Self::Tmux),
            "local" | "pty" | "internal" => Ok(Self::Local),
            "mock" => Ok(Self::Mock),
            _ => Err(Error::backend(
                "parse_backend_kind",
                "factory",
                format!("invalid backend kind '{s}'; valid options: 'tmux', 'local', 'mock'"),
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tmux => write!(f, "tmux"),
            Self::Local => write!(f, "local"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tmux => "tmux",
            Self::Local => "local",
            Self::Mock => "mock",
        }
    }
}

/// Construct the chosen backend. The decision happens here, once; callers
/// hold a `Box<dyn TerminalBackend>` from then on.
pub async fn create_backend(kind: BackendKind, config: &Config) -> Result<Box<dyn TerminalBackend>> {
    match kind {
        BackendKind::Tmux => Ok(Box::new(crate::tmux::TmuxBackend::new(config).await?)),
        BackendKind::Local => Ok(Box::new(crate::local::PtyLocalBackend::new(config))),
        BackendKind::Mock => Ok(Box::new(crate::mock::MockBackend::new(config))),
    }
}

/// Shared validation for `split_pane`.
pub(crate) fn validate_split_percent(
    size_percent: u8,
    operation: &'static str,
    kind: BackendKind,
) -> Result<()> {
    if size_percent == 0 || size_percent >= 100 {
        return Err(Error::backend(
            operation,
            kind.as_str(),
            format!("size_percent must be strictly between 0 and 100, got {size_percent}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips() {
        for kind in [BackendKind::Tmux, BackendKind::Local, BackendKind::Mock] {
            let parsed: BackendKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn backend_kind_accepts_aliases() {
        assert_eq!("pty".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(
            "internal".parse::<BackendKind>().unwrap(),
            BackendKind::Local
        );
        assert!("screen".parse::<BackendKind>().is_err());
    }

    #[test]
    fn split_percent_bounds() {
        assert!(validate_split_percent(1, "split_pane", BackendKind::Mock).is_ok());
        assert!(validate_split_percent(99, "split_pane", BackendKind::Mock).is_ok());
        assert!(validate_split_percent(0, "split_pane", BackendKind::Mock).is_err());
        assert!(validate_split_percent(100, "split_pane", BackendKind::Mock).is_err());
    }
}
