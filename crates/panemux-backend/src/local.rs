use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use panemux_pty::{PtyCommand, PtyProcess, TranscriptLogger};
use panemux_types::{
    Config, Error, PaneId, PaneSize, Result, SessionId, SplitOrientation, WindowId,
};

use crate::backend::{
    validate_split_percent, BackendKind, BackendSessionInfo, CreatedPane, CreatedSession,
    PaneSpec, TerminalBackend,
};

struct LocalSession {
    name: String,
    created_at: DateTime<Utc>,
    working_dir: PathBuf,
    panes: Vec<PaneId>,
}

struct LocalPane {
    session_id: SessionId,
    handle: String,
    working_dir: PathBuf,
    process: Arc<PtyProcess>,
    output: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

#[derive(Default)]
struct LocalState {
    sessions: HashMap<SessionId, LocalSession>,
    panes: HashMap<PaneId, Arc<LocalPane>>,
    next_handle: u64,
}

/// In-process adapter over the PTY engine: every pane is a process this
/// adapter spawned itself, so liveness and capture need no external calls.
pub struct PtyLocalBackend {
    config: Config,
    state: Mutex<LocalState>,
}

impl PtyLocalBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            state: Mutex::new(LocalState::default()),
        }
    }

    fn get_pane(&self, pane_id: PaneId) -> Result<Arc<LocalPane>> {
        self.state
            .lock()
            .unwrap()
            .panes
            .get(&pane_id)
            .cloned()
            .ok_or_else(|| Error::not_found("pane", pane_id))
    }

    fn default_shell() -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    fn spawn_pane(
        &self,
        session_id: SessionId,
        working_dir: PathBuf,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        let command = spec.command.clone().unwrap_or_else(Self::default_shell);
        let size = spec.size.unwrap_or_default();
        let working_dir = spec.working_dir.clone().unwrap_or(working_dir);

        let pane_id = PaneId::new();
        let transcript = match &self.config.transcript_dir {
            Some(dir) => Some(TranscriptLogger::create(dir, pane_id)?),
            None => None,
        };

        let pty_command = PtyCommand::new(command.as_str())
            .cwd(&working_dir)
            .size(size);
        let mut process = PtyProcess::spawn(pane_id, &pty_command, &self.config, transcript)?;
        let output = process.take_output();

        let handle = {
            let mut state = self.state.lock().unwrap();
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            session.panes.push(pane_id);
            state.next_handle += 1;
            let handle = format!("local-{}", state.next_handle);
            state.panes.insert(
                pane_id,
                Arc::new(LocalPane {
                    session_id,
                    handle: handle.clone(),
                    working_dir: working_dir.clone(),
                    process: Arc::new(process),
                    output: Mutex::new(output),
                }),
            );
            handle
        };

        debug!(pane_id = %pane_id, handle, command, "local pane spawned");
        Ok(CreatedPane {
            pane_id,
            handle,
            working_dir,
            command,
            size,
        })
    }
}

#[async_trait]
impl TerminalBackend for PtyLocalBackend {
    async fn create_session(&self, name: &str, cwd: Option<&Path>) -> Result<CreatedSession> {
        let working_dir = cwd
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));

        let mut state = self.state.lock().unwrap();
        if state.sessions.len() >= self.config.max_sessions {
            return Err(Error::backend(
                "create_session",
                "local",
                format!(
                    "maximum concurrent sessions ({}) reached",
                    self.config.max_sessions
                ),
            ));
        }

        let session_id = SessionId::new();
        state.sessions.insert(
            session_id,
            LocalSession {
                name: name.to_string(),
                created_at: Utc::now(),
                working_dir: working_dir.clone(),
                panes: Vec::new(),
            },
        );

        Ok(CreatedSession {
            session_id,
            name: name.to_string(),
            working_dir,
        })
    }

    async fn list_sessions(&self) -> Result<Vec<BackendSessionInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .map(|(id, s)| BackendSessionInfo {
                session_id: *id,
                name: s.name.clone(),
                created_at: s.created_at,
                working_dir: s.working_dir.clone(),
                pane_count: s.panes.len(),
            })
            .collect())
    }

    async fn create_pane(
        &self,
        session_id: SessionId,
        _window: Option<WindowId>,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        let working_dir = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .get(&session_id)
                .map(|s| s.working_dir.clone())
                .ok_or_else(|| Error::not_found("session", session_id))?
        };
        self.spawn_pane(session_id, working_dir, spec)
    }

    async fn split_pane(
        &self,
        session_id: SessionId,
        pane_id: PaneId,
        _orientation: SplitOrientation,
        size_percent: u8,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        validate_split_percent(size_percent, "split_pane", BackendKind::Local)?;

        // The local adapter has no shared surface to subdivide; a split is
        // a sibling pane inheriting the parent's working directory.
        let parent = self.get_pane(pane_id)?;
        if parent.session_id != session_id {
            return Err(Error::not_found("pane", pane_id));
        }
        self.spawn_pane(session_id, parent.working_dir.clone(), spec)
    }

    async fn send_keys(&self, _session_id: SessionId, pane_id: PaneId, keys: &[u8]) -> Result<()> {
        let pane = self.get_pane(pane_id)?;
        pane.process.write(keys).await
    }

    async fn capture_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        max_lines: usize,
    ) -> Result<String> {
        let pane = self.get_pane(pane_id)?;
        Ok(pane.process.capture_tail(max_lines).join("\n"))
    }

    async fn resize_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        size: PaneSize,
    ) -> Result<()> {
        let pane = self.get_pane(pane_id)?;
        pane.process.resize(size)
    }

    async fn kill_pane(&self, _session_id: SessionId, pane_id: PaneId) -> Result<()> {
        let pane = {
            let mut state = self.state.lock().unwrap();
            let pane = state
                .panes
                .remove(&pane_id)
                .ok_or_else(|| Error::not_found("pane", pane_id))?;
            if let Some(session) = state.sessions.get_mut(&pane.session_id) {
                session.panes.retain(|p| *p != pane_id);
            }
            pane
        };
        pane.process.close(self.config.close_grace()).await?;
        Ok(())
    }

    async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        let panes = {
            let mut state = self.state.lock().unwrap();
            let session = state
                .sessions
                .remove(&session_id)
                .ok_or_else(|| Error::not_found("session", session_id))?;
            session
                .panes
                .iter()
                .filter_map(|id| state.panes.remove(id))
                .collect::<Vec<_>>()
        };

        // Session kill is explicit; skip the per-pane grace and terminate
        // immediately so the call returns promptly.
        for pane in panes {
            let _ = pane.process.close(Duration::ZERO).await;
        }
        Ok(())
    }

    async fn is_pane_alive(&self, pane_id: PaneId) -> bool {
        match self.get_pane(pane_id) {
            Ok(pane) => pane.process.is_alive(),
            Err(_) => false,
        }
    }

    async fn output_stream(&self, pane_id: PaneId) -> Result<Option<mpsc::Receiver<Vec<u8>>>> {
        let pane = self.get_pane(pane_id)?;
        let stream = pane.output.lock().unwrap().take();
        Ok(stream)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}
