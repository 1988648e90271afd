use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use panemux_types::{
    Config, Error, PaneId, PaneSize, Result, SessionId, SplitOrientation, WindowId,
};

use crate::backend::{
    validate_split_percent, BackendKind, BackendSessionInfo, CreatedPane, CreatedSession,
    PaneSpec, TerminalBackend,
};

const MOCK_STREAM_DEPTH: usize = 1024;

enum InjectedFailure {
    Error(String),
    Timeout,
}

struct MockSession {
    name: String,
    created_at: DateTime<Utc>,
    working_dir: PathBuf,
    panes: Vec<PaneId>,
}

struct MockPane {
    session_id: SessionId,
    handle: String,
    working_dir: PathBuf,
    command: String,
    size: PaneSize,
    alive: bool,
    lines: Vec<String>,
    partial: String,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl MockPane {
    fn record_bytes(&mut self, bytes: &[u8]) {
        for ch in String::from_utf8_lossy(bytes).chars() {
            match ch {
                '\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.lines
                        .push(line.strip_suffix('\r').unwrap_or(&line).to_string());
                }
                _ => self.partial.push(ch),
            }
        }
    }

    fn tail(&self, max_lines: usize) -> String {
        let mut all: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        if !self.partial.is_empty() {
            all.push(&self.partial);
        }
        let skip = all.len().saturating_sub(max_lines);
        all[skip..].join("\n")
    }
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<SessionId, MockSession>,
    panes: HashMap<PaneId, MockPane>,
    next_handle: u64,
    failures: HashMap<&'static str, VecDeque<InjectedFailure>>,
}

/// Deterministic in-memory backend for fast, hermetic tests.
///
/// Supports injectable failure modes per operation, pre-seeded captured
/// output, and out-of-band death simulation. `send_keys` appends the keys
/// to the pane's captured output verbatim (terminal echo); the mock never
/// interprets command semantics.
pub struct MockBackend {
    max_sessions: usize,
    max_dimension: u16,
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            max_sessions: config.max_sessions,
            max_dimension: config.max_dimension,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Queue a failure for the next call of `operation`.
    pub fn inject_failure(&self, operation: &'static str, message: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(InjectedFailure::Error(message.into()));
    }

    /// Queue a timeout for the next call of `operation`.
    pub fn inject_timeout(&self, operation: &'static str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(operation)
            .or_default()
            .push_back(InjectedFailure::Timeout);
    }

    /// Pre-seed captured output and push it onto the pane's stream.
    pub async fn seed_output(&self, pane_id: PaneId, bytes: &[u8]) -> Result<()> {
        self.emit(pane_id, bytes).await
    }

    /// Simulate the underlying process dying out-of-band: the pane stops
    /// reporting alive and its output stream ends, but the engine is not
    /// told through any other channel.
    pub fn simulate_exit(&self, pane_id: PaneId) {
        let mut state = self.state.lock().unwrap();
        if let Some(pane) = state.panes.get_mut(&pane_id) {
            pane.alive = false;
            pane.tx = None;
        }
    }

    fn take_failure(&self, operation: &'static str) -> Result<()> {
        let failure = self
            .state
            .lock()
            .unwrap()
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match failure {
            None => Ok(()),
            Some(InjectedFailure::Error(message)) => {
                Err(Error::backend(operation, "mock", message))
            }
            Some(InjectedFailure::Timeout) => Err(Error::BackendTimeout {
                operation,
                timeout: Duration::from_millis(0),
            }),
        }
    }

    async fn emit(&self, pane_id: PaneId, bytes: &[u8]) -> Result<()> {
        let tx = {
            let mut state = self.state.lock().unwrap();
            let pane = state
                .panes
                .get_mut(&pane_id)
                .ok_or_else(|| Error::not_found("pane", pane_id))?;
            if !pane.alive {
                return Err(Error::ChannelClosed {
                    id: pane_id,
                    channel: "input",
                });
            }
            pane.record_bytes(bytes);
            pane.tx.clone()
        };
        if let Some(tx) = tx {
            // A dropped receiver just means nobody is forwarding.
            let _ = tx.send(bytes.to_vec()).await;
        }
        Ok(())
    }

    fn add_pane(
        &self,
        session_id: SessionId,
        working_dir: PathBuf,
        command: String,
        size: PaneSize,
    ) -> Result<CreatedPane> {
        size.validate(self.max_dimension)?;
        let pane_id = PaneId::new();
        let (tx, rx) = mpsc::channel(MOCK_STREAM_DEPTH);

        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        session.panes.push(pane_id);
        state.next_handle += 1;
        let handle = format!("mock-%{}", state.next_handle);
        state.panes.insert(
            pane_id,
            MockPane {
                session_id,
                handle: handle.clone(),
                working_dir: working_dir.clone(),
                command: command.clone(),
                size,
                alive: true,
                lines: Vec::new(),
                partial: String::new(),
                tx: Some(tx),
                rx: Some(rx),
            },
        );

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
impl TerminalBackend for MockBackend {
    async fn create_session(&self, name: &str, cwd: Option<&Path>) -> Result<CreatedSession> {
        self.take_failure("create_session")?;

        let working_dir = cwd
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut state = self.state.lock().unwrap();
        if state.sessions.len() >= self.max_sessions {
            return Err(Error::backend(
                "create_session",
                "mock",
                format!("maximum concurrent sessions ({}) reached", self.max_sessions),
            ));
        }

        let session_id = SessionId::new();
        state.sessions.insert(
            session_id,
            MockSession {
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
        self.take_failure("list_sessions")?;
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
        self.take_failure("create_pane")?;

        let working_dir = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .get(&session_id)
                .map(|s| s.working_dir.clone())
                .ok_or_else(|| Error::not_found("session", session_id))?
        };
        let working_dir = spec.working_dir.clone().unwrap_or(working_dir);
        let command = spec.command.clone().unwrap_or_else(|| "/bin/sh".to_string());
        self.add_pane(
            session_id,
            working_dir,
            command,
            spec.size.unwrap_or_default(),
        )
    }

    async fn split_pane(
        &self,
        session_id: SessionId,
        pane_id: PaneId,
        _orientation: SplitOrientation,
        size_percent: u8,
        spec: &PaneSpec,
    ) -> Result<CreatedPane> {
        self.take_failure("split_pane")?;
        validate_split_percent(size_percent, "split_pane", BackendKind::Mock)?;

        let (parent_cwd, parent_size) = {
            let state = self.state.lock().unwrap();
            let pane = state
                .panes
                .get(&pane_id)
                .filter(|p| p.session_id == session_id)
                .ok_or_else(|| Error::not_found("pane", pane_id))?;
            (pane.working_dir.clone(), pane.size)
        };

        let working_dir = spec.working_dir.clone().unwrap_or(parent_cwd);
        let command = spec.command.clone().unwrap_or_else(|| "/bin/sh".to_string());
        self.add_pane(
            session_id,
            working_dir,
            command,
            spec.size.unwrap_or(parent_size),
        )
    }

    async fn send_keys(&self, _session_id: SessionId, pane_id: PaneId, keys: &[u8]) -> Result<()> {
        self.take_failure("send_keys")?;
        self.emit(pane_id, keys).await
    }

    async fn capture_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        max_lines: usize,
    ) -> Result<String> {
        self.take_failure("capture_pane")?;
        let state = self.state.lock().unwrap();
        let pane = state
            .panes
            .get(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;
        Ok(pane.tail(max_lines))
    }

    async fn resize_pane(
        &self,
        _session_id: SessionId,
        pane_id: PaneId,
        size: PaneSize,
    ) -> Result<()> {
        self.take_failure("resize_pane")?;
        size.validate(self.max_dimension)?;
        let mut state = self.state.lock().unwrap();
        let pane = state
            .panes
            .get_mut(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;
        pane.size = size;
        Ok(())
    }

    async fn kill_pane(&self, _session_id: SessionId, pane_id: PaneId) -> Result<()> {
        self.take_failure("kill_pane")?;
        let mut state = self.state.lock().unwrap();
        let pane = state
            .panes
            .remove(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;
        if let Some(session) = state.sessions.get_mut(&pane.session_id) {
            session.panes.retain(|p| *p != pane_id);
        }
        Ok(())
    }

    async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        self.take_failure("kill_session")?;
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .remove(&session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        for pane_id in session.panes {
            state.panes.remove(&pane_id);
        }
        Ok(())
    }

    async fn is_pane_alive(&self, pane_id: PaneId) -> bool {
        let state = self.state.lock().unwrap();
        state.panes.get(&pane_id).map(|p| p.alive).unwrap_or(false)
    }

    async fn output_stream(&self, pane_id: PaneId) -> Result<Option<mpsc::Receiver<Vec<u8>>>> {
        let mut state = self.state.lock().unwrap();
        let pane = state
            .panes
            .get_mut(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;
        Ok(pane.rx.take())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MockBackend {
        MockBackend::new(&Config::default())
    }

    async fn session_with_pane(be: &MockBackend) -> (SessionId, PaneId) {
        let session = be.create_session("demo", None).await.unwrap();
        let pane = be
            .create_pane(session.session_id, None, &PaneSpec::default())
            .await
            .unwrap();
        (session.session_id, pane.pane_id)
    }

    #[tokio::test]
    async fn echo_scenario_from_the_shell_contract() {
        let be = backend();
        let (session_id, pane_id) = session_with_pane(&be).await;

        be.send_keys(session_id, pane_id, b"echo hi\n").await.unwrap();
        let captured = be.capture_pane(session_id, pane_id, 10).await.unwrap();
        assert!(captured.contains("hi"), "got: {captured}");
    }

    #[tokio::test]
    async fn capture_truncates_from_the_tail() {
        let be = backend();
        let (session_id, pane_id) = session_with_pane(&be).await;

        for i in 0..10 {
            be.seed_output(pane_id, format!("line-{i}\n").as_bytes())
                .await
                .unwrap();
        }
        let captured = be.capture_pane(session_id, pane_id, 3).await.unwrap();
        assert_eq!(captured, "line-7\nline-8\nline-9");
    }

    #[tokio::test]
    async fn output_stream_carries_seeded_bytes_in_order() {
        let be = backend();
        let (_session_id, pane_id) = session_with_pane(&be).await;
        let mut rx = be.output_stream(pane_id).await.unwrap().unwrap();

        be.seed_output(pane_id, b"first ").await.unwrap();
        be.seed_output(pane_id, b"second").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"first ".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"second".to_vec());
    }

    #[tokio::test]
    async fn simulate_exit_ends_stream_and_liveness() {
        let be = backend();
        let (_session_id, pane_id) = session_with_pane(&be).await;
        let mut rx = be.output_stream(pane_id).await.unwrap().unwrap();

        assert!(be.is_pane_alive(pane_id).await);
        be.simulate_exit(pane_id);
        assert!(!be.is_pane_alive(pane_id).await);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn injected_failure_hits_exactly_one_call() {
        let be = backend();
        be.inject_failure("create_session", "backend offline");

        let err = be.create_session("a", None).await.unwrap_err();
        assert!(matches!(err, Error::Backend { operation: "create_session", .. }));

        // The next call is clean.
        be.create_session("a", None).await.unwrap();
    }

    #[tokio::test]
    async fn injected_timeout_is_typed() {
        let be = backend();
        let (session_id, pane_id) = session_with_pane(&be).await;
        be.inject_timeout("capture_pane");

        let err = be.capture_pane(session_id, pane_id, 10).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn kill_session_removes_descendant_panes() {
        let be = backend();
        let (session_id, pane_id) = session_with_pane(&be).await;

        be.kill_session(session_id).await.unwrap();
        assert!(!be.is_pane_alive(pane_id).await);
        assert!(matches!(
            be.capture_pane(session_id, pane_id, 1).await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn send_keys_after_exit_is_channel_closed() {
        let be = backend();
        let (session_id, pane_id) = session_with_pane(&be).await;
        be.simulate_exit(pane_id);

        let err = be.send_keys(session_id, pane_id, b"late\n").await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn split_validates_percent_and_inherits_cwd() {
        let be = backend();
        let session = be
            .create_session("demo", Some(Path::new("/work")))
            .await
            .unwrap();
        let parent = be
            .create_pane(session.session_id, None, &PaneSpec::default())
            .await
            .unwrap();

        let child = be
            .split_pane(
                session.session_id,
                parent.pane_id,
                SplitOrientation::Horizontal,
                30,
                &PaneSpec::default(),
            )
            .await
            .unwrap();
        assert_eq!(child.working_dir, PathBuf::from("/work"));

        for bad in [0u8, 100] {
            let err = be
                .split_pane(
                    session.session_id,
                    parent.pane_id,
                    SplitOrientation::Horizontal,
                    bad,
                    &PaneSpec::default(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Backend { .. }));
        }
    }
}
