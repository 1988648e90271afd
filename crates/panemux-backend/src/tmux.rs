use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use panemux_types::{
    Config, Error, PaneId, PaneSize, Result, SessionId, SplitOrientation, WindowId,
};

use crate::backend::{
    validate_split_percent, BackendKind, BackendSessionInfo, CreatedPane, CreatedSession,
    PaneSpec, TerminalBackend,
};

struct TmuxPane {
    session_id: SessionId,
    tmux_id: String,
    working_dir: PathBuf,
    command: String,
    size: PaneSize,
}

struct TmuxSession {
    tmux_name: String,
    display_name: String,
    created_at: DateTime<Utc>,
    working_dir: PathBuf,
    panes: Vec<PaneId>,
    /// The pane tmux creates with the session, consumed by the first
    /// unqualified `create_pane`.
    initial_pane: Option<String>,
}

#[derive(Default)]
struct TmuxState {
    sessions: HashMap<SessionId, TmuxSession>,
    panes: HashMap<PaneId, TmuxPane>,
}

/// Adapter driving an external tmux server.
///
/// Each operation maps to one tmux invocation. The control channel is
/// serialized behind an async mutex (single-writer discipline: interleaved
/// control commands can corrupt multiplexer state), and every invocation is
/// bounded by the configured backend timeout. tmux is authoritative for
/// liveness, so `is_pane_alive` always asks it rather than trusting the
/// local maps.
pub struct TmuxBackend {
    control: AsyncMutex<()>,
    state: Mutex<TmuxState>,
    call_timeout: Duration,
    max_dimension: u16,
    max_sessions: usize,
    name_prefix: String,
    counter: AtomicU64,
}

impl TmuxBackend {
    /// Verify tmux is reachable and build the adapter.
    pub async fn new(config: &Config) -> Result<Self> {
        let backend = Self {
            control: AsyncMutex::new(()),
            state: Mutex::new(TmuxState::default()),
            call_timeout: config.backend_timeout(),
            max_dimension: config.max_dimension,
            max_sessions: config.max_sessions,
            name_prefix: format!("panemux-{}", std::process::id()),
            counter: AtomicU64::new(1),
        };
        backend.run_tmux("verify_tmux", &["-V"]).await?;
        Ok(backend)
    }

    /// Run one tmux command under the control lock, bounded by the timeout.
    async fn run_tmux(&self, operation: &'static str, args: &[&str]) -> Result<String> {
        let _guard = self.control.lock().await;

        let mut command = Command::new("tmux");
        command.args(args);
        let output = match timeout(self.call_timeout, command.output()).await {
            Err(_) => {
                return Err(Error::BackendTimeout {
                    operation,
                    timeout: self.call_timeout,
                })
            }
            Ok(Err(err)) => {
                return Err(Error::backend(
                    operation,
                    "tmux",
                    format!("failed to invoke tmux: {err}"),
                ))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::backend(operation, "tmux", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn next_session_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.name_prefix)
    }

    fn lookup_pane(&self, pane_id: PaneId) -> Result<(String, PathBuf)> {
        let state = self.state.lock().unwrap();
        let pane = state
            .panes
            .get(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;
        Ok((pane.tmux_id.clone(), pane.working_dir.clone()))
    }

    fn default_cwd() -> PathBuf {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    fn default_shell() -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    /// "can't find pane/session" after an out-of-band death is not a
    /// failure of kill: the target is already gone.
    fn is_missing_target(err: &Error) -> bool {
        matches!(err, Error::Backend { message, .. } if message.contains("can't find"))
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    async fn create_session(&self, name: &str, cwd: Option<&Path>) -> Result<CreatedSession> {
        {
            let state = self.state.lock().unwrap();
            if state.sessions.len() >= self.max_sessions {
                return Err(Error::backend(
                    "create_session",
                    "tmux",
                    format!("maximum concurrent sessions ({}) reached", self.max_sessions),
                ));
            }
        }

        let tmux_name = self.next_session_name();
        let working_dir = cwd.map(Path::to_path_buf).unwrap_or_else(Self::default_cwd);
        let cwd_str = working_dir.display().to_string();

        // -P -F prints the id of the initial pane tmux creates alongside
        // the session; it is handed to the first create_pane.
        let stdout = self
            .run_tmux(
                "create_session",
                &[
                    "new-session", "-d", "-s", &tmux_name, "-x", "80", "-y", "24", "-c", &cwd_str,
                    "-P", "-F", "#{pane_id}",
                ],
            )
            .await?;

        let session_id = SessionId::new();
        let initial_pane = stdout.trim().to_string();
        self.state.lock().unwrap().sessions.insert(
            session_id,
            TmuxSession {
                tmux_name,
                display_name: name.to_string(),
                created_at: Utc::now(),
                working_dir: working_dir.clone(),
                panes: Vec::new(),
                initial_pane: (!initial_pane.is_empty()).then_some(initial_pane),
            },
        );

        debug!(session_id = %session_id, name, "tmux session created");
        Ok(CreatedSession {
            session_id,
            name: name.to_string(),
            working_dir,
        })
    }

    async fn list_sessions(&self) -> Result<Vec<BackendSessionInfo>> {
        let snapshot: Vec<(SessionId, String, String, DateTime<Utc>, PathBuf, usize)> = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .iter()
                .map(|(id, s)| {
                    (
                        *id,
                        s.tmux_name.clone(),
                        s.display_name.clone(),
                        s.created_at,
                        s.working_dir.clone(),
                        s.panes.len(),
                    )
                })
                .collect()
        };

        let mut sessions = Vec::new();
        for (session_id, tmux_name, name, created_at, working_dir, pane_count) in snapshot {
            // tmux is authoritative: skip sessions it no longer knows.
            if self
                .run_tmux("list_sessions", &["has-session", "-t", &tmux_name])
                .await
                .is_err()
            {
                continue;
            }
            sessions.push(BackendSessionInfo {
                session_id,
                name,
                created_at,
                working_dir,
                pane_count,
            });
        }
        Ok(sessions)
    }

    async fn create_pane(
        &self,
        session_id: SessionId,
        _window: Option<WindowId>,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        let (tmux_name, session_cwd, initial_pane) = {
            let mut state = self.state.lock().unwrap();
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            // Only a pane without overrides can reuse the initial one; it is
            // already running the default shell in the session's directory.
            let initial = if spec.command.is_none() && spec.working_dir.is_none() {
                session.initial_pane.take()
            } else {
                None
            };
            (
                session.tmux_name.clone(),
                session.working_dir.clone(),
                initial,
            )
        };

        let working_dir = spec.working_dir.clone().unwrap_or(session_cwd);
        let command = spec.command.clone().unwrap_or_else(Self::default_shell);
        let size = spec.size.unwrap_or_default();
        size.validate(self.max_dimension)?;

        let tmux_id = match initial_pane {
            Some(id) => id,
            None => {
                let target = format!("{tmux_name}:");
                let cwd_str = working_dir.display().to_string();
                let mut args: Vec<&str> = vec![
                    "new-window", "-t", &target, "-c", &cwd_str, "-P", "-F", "#{pane_id}",
                ];
                if spec.command.is_some() {
                    args.push(command.as_str());
                }
                self.run_tmux("create_pane", &args).await?.trim().to_string()
            }
        };

        let pane_id = PaneId::new();
        {
            let mut state = self.state.lock().unwrap();
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            session.panes.push(pane_id);
            state.panes.insert(
                pane_id,
                TmuxPane {
                    session_id,
                    tmux_id: tmux_id.clone(),
                    working_dir: working_dir.clone(),
                    command: command.clone(),
                    size,
                },
            );
        }

        Ok(CreatedPane {
            pane_id,
            handle: tmux_id,
            working_dir,
            command,
            size,
        })
    }

    async fn split_pane(
        &self,
        session_id: SessionId,
        pane_id: PaneId,
        orientation: SplitOrientation,
        size_percent: u8,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        validate_split_percent(size_percent, "split_pane", BackendKind::Tmux)?;

        let (parent_tmux_id, parent_cwd) = self.lookup_pane(pane_id)?;
        let working_dir = spec.working_dir.clone().unwrap_or(parent_cwd);
        let command = spec.command.clone().unwrap_or_else(Self::default_shell);
        let size = spec.size.unwrap_or_default();
        size.validate(self.max_dimension)?;

        let direction = match orientation {
            SplitOrientation::Horizontal => "-h",
            SplitOrientation::Vertical => "-v",
        };
        let percent = size_percent.to_string();
        let cwd_str = working_dir.display().to_string();
        let mut args: Vec<&str> = vec![
            "split-window",
            "-t",
            &parent_tmux_id,
            direction,
            "-p",
            &percent,
            "-c",
            &cwd_str,
            "-P",
            "-F",
            "#{pane_id}",
        ];
        if spec.command.is_some() {
            args.push(command.as_str());
        }
        let tmux_id = self.run_tmux("split_pane", &args).await?.trim().to_string();

        let new_pane_id = PaneId::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.panes.push(new_pane_id);
            }
            state.panes.insert(
                new_pane_id,
                TmuxPane {
                    session_id,
                    tmux_id: tmux_id.clone(),
                    working_dir: working_dir.clone(),
                    command: command.clone(),
                    size,
                },
            );
        }

        Ok(CreatedPane {
            pane_id: new_pane_id,
            handle: tmux_id,
            working_dir,
            command,
            size,
        })
    }

    async fn send_keys(&self, _session_id: SessionId, pane_id: PaneId, keys: &[u8]) -> Result<()> {
        let (tmux_id, _) = self.lookup_pane(pane_id)?;
        let text = String::from_utf8_lossy(keys).to_string();
        // -l sends the bytes literally; without it tmux would interpret
        // key names like "Enter".
        self.run_tmux(
            "send_keys",
            &["send-keys", "-t", &tmux_id, "-l", "--", &text],
        )
        .await?;
        Ok(())
    }

    async fn capture_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        max_lines: usize,
    ) -> Result<String> {
        let (tmux_id, _) = self.lookup_pane(pane_id)?;
        let start = format!("-{max_lines}");
        let output = self
            .run_tmux(
                "capture_pane",
                &["capture-pane", "-p", "-t", &tmux_id, "-S", &start],
            )
            .await?;

        // tmux may hand back more than requested; truncate from the tail.
        let lines: Vec<&str> = output.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].join("\n"))
    }

    async fn resize_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        size: PaneSize,
    ) -> Result<()> {
        size.validate(self.max_dimension)?;
        let (tmux_id, _) = self.lookup_pane(pane_id)?;
        let cols = size.cols.to_string();
        let rows = size.rows.to_string();
        self.run_tmux(
            "resize_pane",
            &["resize-pane", "-t", &tmux_id, "-x", &cols, "-y", &rows],
        )
        .await?;

        if let Some(pane) = self.state.lock().unwrap().panes.get_mut(&pane_id) {
            pane.size = size;
        }
        Ok(())
    }

    async fn kill_pane(&self, _session_id: SessionId, pane_id: PaneId) -> Result<()> {
        let (tmux_id, _) = self.lookup_pane(pane_id)?;

        let result = self
            .run_tmux("kill_pane", &["kill-pane", "-t", &tmux_id])
            .await;
        match result {
            Ok(_) => {}
            Err(ref err) if Self::is_missing_target(err) => {
                warn!(pane_id = %pane_id, "pane already gone at kill");
            }
            Err(err) => return Err(err),
        }

        let mut state = self.state.lock().unwrap();
        if let Some(pane) = state.panes.remove(&pane_id) {
            if let Some(session) = state.sessions.get_mut(&pane.session_id) {
                session.panes.retain(|p| *p != pane_id);
            }
        }
        Ok(())
    }

    async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        let tmux_name = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .get(&session_id)
                .map(|s| s.tmux_name.clone())
                .ok_or_else(|| Error::not_found("session", session_id))?
        };

        let result = self
            .run_tmux("kill_session", &["kill-session", "-t", &tmux_name])
            .await;
        match result {
            Ok(_) => {}
            Err(ref err) if Self::is_missing_target(err) => {
                warn!(session_id = %session_id, "session already gone at kill");
            }
            Err(err) => return Err(err),
        }

        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.remove(&session_id) {
            for pane_id in session.panes {
                state.panes.remove(&pane_id);
            }
        }
        Ok(())
    }

    async fn is_pane_alive(&self, pane_id: PaneId) -> bool {
        let Ok((tmux_id, _)) = self.lookup_pane(pane_id) else {
            return false;
        };
        match self
            .run_tmux(
                "is_pane_alive",
                &["display-message", "-p", "-t", &tmux_id, "#{pane_dead}"],
            )
            .await
        {
            Ok(output) => output.trim() == "0",
            Err(_) => false,
        }
    }

    async fn output_stream(&self, _pane_id: PaneId) -> Result<Option<mpsc::Receiver<Vec<u8>>>> {
        // tmux owns the PTYs; output is reached through capture_pane.
        Ok(None)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Tmux
    }
}
