use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use panemux_backend::{create_backend, BackendKind, PaneSpec, TerminalBackend};
use panemux_events::{BusSubscriber, Capability, EventBus, Plugin, PluginHost};
use panemux_state::{Snapshot, StateManager, StateStore};
use panemux_types::{
    CloseReason, Config, Error, Event, Layout, PaneId, PaneRecord, PaneSize, PaneStatus,
    Result, SessionId, SessionRecord, SplitOrientation, WindowId,
};

/// Runtime bookkeeping for one live pane.
///
/// `closed` arbitrates the single `PaneClosed` emission between the
/// forwarder (stream end), the liveness poller (missed exit), and explicit
/// kills — whichever observes the death first wins.
struct PaneRuntime {
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
}

/// Single entry point coordinating the backend, the state manager, and the
/// event bus.
///
/// Per-pane state machine: `Spawning -> Running -> {Exited | Killed |
/// Error}`, driven by liveness polling and explicit action results. Actions
/// are idempotent where safe (killing a dead pane or session succeeds) and
/// reject unknown ids with `Error::NotFound`.
pub struct TerminalManager {
    config: Config,
    backend: Arc<dyn TerminalBackend>,
    state: Arc<StateManager>,
    bus: EventBus,
    plugins: PluginHost,
    runtimes: Mutex<HashMap<PaneId, PaneRuntime>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalManager {
    /// Build a manager over the backend selected by `kind`. The concrete
    /// strategy is decided here, once; nothing downstream branches on it.
    pub async fn new(
        kind: BackendKind,
        store: Arc<dyn StateStore>,
        config: Config,
    ) -> Result<Arc<Self>> {
        let backend = Arc::from(create_backend(kind, &config).await?);
        Self::with_backend(backend, store, config)
    }

    /// Build a manager over an already-constructed backend. Used by tests
    /// that need to keep a concrete handle for fault injection.
    ///
    /// Must be called from within a tokio runtime: the state flusher and
    /// the liveness poller are spawned here.
    pub fn with_backend(
        backend: Arc<dyn TerminalBackend>,
        store: Arc<dyn StateStore>,
        config: Config,
    ) -> Result<Arc<Self>> {
        let bus = EventBus::new(config.subscriber_queue_depth);
        let state = Arc::new(StateManager::new(store, bus.clone()));
        let plugins = PluginHost::new(
            bus.clone(),
            [
                Capability::Lifecycle,
                Capability::PaneOutput,
                Capability::Commands,
            ],
            config.subscriber_queue_depth,
        );

        let manager = Arc::new(Self {
            config,
            backend,
            state,
            bus,
            plugins,
            runtimes: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
        });

        let flusher = manager
            .state
            .spawn_flusher(manager.config.flush_interval());
        let poller = Self::spawn_liveness_poller(&manager);
        manager.background.lock().unwrap().extend([flusher, poller]);

        info!(backend = %manager.backend.kind(), store = manager.state.store_name(), "manager started");
        Ok(manager)
    }

    /// Subscribe to the manager's event stream.
    pub fn subscribe(&self, name: &str) -> BusSubscriber {
        self.bus.subscribe(name)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Register a plugin with the host.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.plugins.register(plugin)
    }

    /// Invoke a named plugin command.
    pub async fn invoke_plugin(
        &self,
        plugin: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.plugins.invoke(plugin, command, args).await
    }

    // -----------------------------------------------------------------
    // Session actions
    // -----------------------------------------------------------------

    pub async fn create_session(&self, name: &str, cwd: Option<&Path>) -> Result<SessionRecord> {
        let created = self.backend.create_session(name, cwd).await?;

        // Record the session plus its default window; if the state layer
        // refuses, tear the backend session down again so nothing leaks.
        let result = async {
            let record = self
                .state
                .create_session_record(SessionRecord::with_id(created.session_id, name))
                .await?;
            self.state
                .create_window_record(record.id, Layout::default())
                .await?;
            Ok::<_, Error>(record)
        }
        .await;
        let record = match result {
            Ok(record) => record,
            Err(err) => {
                let _ = self.backend.kill_session(created.session_id).await;
                return Err(err);
            }
        };

        self.bus.publish(Event::SessionCreated {
            session_id: record.id,
            name: name.to_string(),
        });
        // Re-read so the returned record carries the window reference.
        self.state.get_session(record.id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        self.state.list_sessions().await
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionRecord> {
        self.state.get_session(session_id).await
    }

    pub async fn rename_session(&self, session_id: SessionId, name: &str) -> Result<SessionRecord> {
        self.state.rename_session(session_id, name).await
    }

    /// Kill a session and every descendant pane. Idempotent: a second call
    /// for an already-removed session succeeds. No `PaneOutput` event for
    /// this session follows the return.
    pub async fn kill_session(&self, session_id: SessionId) -> Result<()> {
        if self.state.get_session(session_id).await.is_err() {
            debug!(session_id = %session_id, "kill_session on absent session is a no-op");
            return Ok(());
        }

        // Stop the forwarders first so no further output can be published,
        // then tear down the backend, then the records.
        let panes = self.state.session_panes(session_id).await;
        for pane in &panes {
            self.stop_forwarder(pane.id).await;
        }

        match self.backend.kill_session(session_id).await {
            Ok(()) => {}
            Err(Error::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let live: Vec<PaneId> = panes
            .iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.id)
            .collect();
        self.state.delete_session_cascade(session_id).await?;

        for pane_id in live {
            if self.mark_closed(pane_id) {
                self.bus.publish(Event::PaneClosed {
                    pane_id,
                    reason: CloseReason::Killed,
                });
            }
        }
        // Release runtime entries of panes that were already terminal.
        for pane in &panes {
            let _ = self.take_closed_flag(pane.id);
        }

        self.bus.publish(Event::SessionKilled { session_id });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pane actions
    // -----------------------------------------------------------------

    pub async fn create_pane(
        &self,
        session_id: SessionId,
        window_id: Option<WindowId>,
        spec: &PaneSpec,
    ) -> Result<PaneRecord> {
        let session = self.state.get_session(session_id).await?;
        let window_id = match window_id {
            Some(id) => self.state.get_window(id).await?.id,
            None => *session
                .windows
                .first()
                .ok_or_else(|| Error::not_found("window", "default"))?,
        };

        let created = self
            .backend
            .create_pane(session_id, Some(window_id), spec)
            .await?;
        self.adopt_pane(session_id, window_id, created).await
    }

    pub async fn split_pane(
        &self,
        pane_id: PaneId,
        orientation: SplitOrientation,
        size_percent: u8,
        spec: &PaneSpec,
    ) -> Result<PaneRecord> {
        let parent = self.state.get_pane(pane_id).await?;
        let created = self
            .backend
            .split_pane(parent.session_id, pane_id, orientation, size_percent, spec)
            .await?;
        self.adopt_pane(parent.session_id, parent.window_id, created)
            .await
    }

    /// Record a backend-created pane, attach its forwarder, and announce it.
    async fn adopt_pane(
        &self,
        session_id: SessionId,
        window_id: WindowId,
        created: panemux_backend::CreatedPane,
    ) -> Result<PaneRecord> {
        let record = PaneRecord::new(
            created.pane_id,
            session_id,
            window_id,
            created.handle,
            created.working_dir,
            created.command,
            created.size,
        );
        let record = match self.state.create_pane_record(record).await {
            Ok(record) => record,
            Err(err) => {
                // Unrecorded panes must not keep running.
                let _ = self.backend.kill_pane(session_id, created.pane_id).await;
                return Err(err);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let forwarder = match self.backend.output_stream(record.id).await? {
            Some(rx) => Some(self.spawn_forwarder(
                record.id,
                rx,
                cancel.clone(),
                Arc::clone(&closed),
            )),
            // Poll-only backend: liveness polling covers the close signal.
            None => None,
        };
        self.runtimes.lock().unwrap().insert(
            record.id,
            PaneRuntime {
                cancel,
                closed,
                forwarder,
            },
        );

        // The backend spawned it; creation success is the Running signal.
        let record = self.state.transition_pane(record.id, PaneStatus::Running).await?;

        self.bus.publish(Event::PaneCreated {
            session_id,
            window_id,
            pane_id: record.id,
        });
        Ok(record)
    }

    pub async fn get_pane(&self, pane_id: PaneId) -> Result<PaneRecord> {
        self.state.get_pane(pane_id).await
    }

    pub async fn send_input(&self, pane_id: PaneId, bytes: &[u8]) -> Result<()> {
        let pane = self.state.get_pane(pane_id).await?;
        if pane.status.is_terminal() {
            return Err(Error::ChannelClosed {
                id: pane_id,
                channel: "input",
            });
        }
        self.backend
            .send_keys(pane.session_id, pane_id, bytes)
            .await
    }

    /// Resize a pane. Invalid dimensions are rejected before any backend
    /// or record mutation, so failed calls leave state untouched.
    pub async fn resize_pane(&self, pane_id: PaneId, size: PaneSize) -> Result<PaneRecord> {
        size.validate(self.config.max_dimension)?;

        let pane = self.state.get_pane(pane_id).await?;
        if pane.status.is_terminal() {
            return Err(Error::ChannelClosed {
                id: pane_id,
                channel: "resize",
            });
        }

        self.backend
            .resize_pane(pane.session_id, pane_id, size)
            .await?;
        let record = self.state.update_pane_size(pane_id, size).await?;
        self.bus.publish(Event::PaneResized { pane_id, size });
        Ok(record)
    }

    /// Capture the tail of a pane's output. Read-only, so a backend
    /// timeout is retried once after a short backoff; mutating actions
    /// never get that treatment.
    pub async fn capture_pane(&self, pane_id: PaneId, max_lines: usize) -> Result<String> {
        let pane = self.state.get_pane(pane_id).await?;
        match self
            .backend
            .capture_pane(pane.session_id, pane_id, max_lines)
            .await
        {
            Err(err) if err.is_timeout() => {
                warn!(pane_id = %pane_id, "capture timed out, retrying once");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                self.backend
                    .capture_pane(pane.session_id, pane_id, max_lines)
                    .await
            }
            other => other,
        }
    }

    /// Kill a pane. Idempotent on an already-dead pane; unknown ids are
    /// rejected. The pane's forwarder is stopped before the backend kill,
    /// so no output events trail the return.
    pub async fn kill_pane(&self, pane_id: PaneId) -> Result<()> {
        let pane = self.state.get_pane(pane_id).await?;
        if pane.status.is_terminal() {
            let _ = self.take_closed_flag(pane_id);
            return Ok(());
        }

        self.stop_forwarder(pane_id).await;

        match self.backend.kill_pane(pane.session_id, pane_id).await {
            Ok(()) => {}
            // Already gone at the backend: the record transition below
            // still applies.
            Err(Error::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        self.state
            .transition_pane(pane_id, PaneStatus::Killed)
            .await?;
        if self.mark_closed(pane_id) {
            self.bus.publish(Event::PaneClosed {
                pane_id,
                reason: CloseReason::Killed,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Snapshot / restore
    // -----------------------------------------------------------------

    pub async fn snapshot(&self) -> Snapshot {
        self.state.snapshot().await
    }

    /// Install a snapshot, then reconcile every pane against backend
    /// liveness: a record whose pane the backend no longer knows is marked
    /// `Exited` rather than assumed live.
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        self.state.restore(snapshot).await?;
        self.reconcile_liveness().await;
        Ok(())
    }

    /// Startup path: load the store's last snapshot and reconcile.
    pub async fn restore_from_store(&self) -> Result<bool> {
        let found = self.state.load_from_store().await?;
        if found {
            self.reconcile_liveness().await;
        }
        Ok(found)
    }

    async fn reconcile_liveness(&self) {
        for pane in self.state.list_panes().await {
            if pane.status.is_terminal() {
                continue;
            }
            if !self.backend.is_pane_alive(pane.id).await {
                debug!(pane_id = %pane.id, "stale pane record marked exited on restore");
                let _ = self.state.transition_pane(pane.id, PaneStatus::Exited).await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Liveness polling
    // -----------------------------------------------------------------

    /// One poll pass: transition panes the backend reports dead and emit
    /// their `PaneClosed`. Public so tests can drive it deterministically.
    pub async fn poll_liveness(&self) {
        for pane in self.state.list_panes().await {
            if pane.status.is_terminal() {
                continue;
            }
            if self.backend.is_pane_alive(pane.id).await {
                continue;
            }

            // Unexpected exit: report, never auto-restart.
            if self
                .state
                .transition_pane(pane.id, PaneStatus::Exited)
                .await
                .is_ok()
            {
                let closed = self
                    .runtimes
                    .lock()
                    .unwrap()
                    .get(&pane.id)
                    .map(|r| Arc::clone(&r.closed));
                let first = match closed {
                    Some(flag) => !flag.swap(true, Ordering::SeqCst),
                    None => true,
                };
                if first {
                    self.bus.publish(Event::PaneClosed {
                        pane_id: pane.id,
                        reason: CloseReason::Exited,
                    });
                }
            }
        }
    }

    fn spawn_liveness_poller(manager: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(manager);
        let interval = manager.config.liveness_poll();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = Weak::upgrade(&weak) else {
                    break;
                };
                manager.poll_liveness().await;
            }
        })
    }

    // -----------------------------------------------------------------
    // Forwarders
    // -----------------------------------------------------------------

    /// One forwarder per streaming pane: pulls the backend's output
    /// sequence and republishes it as `PaneOutput`. Cancellation is a
    /// single stop-pulling action; stream end means the process exited.
    fn spawn_forwarder(
        &self,
        pane_id: PaneId,
        mut rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
        closed: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(bytes) => bus.publish(Event::PaneOutput { pane_id, bytes }),
                        None => {
                            if !closed.swap(true, Ordering::SeqCst) {
                                let _ = state.transition_pane(pane_id, PaneStatus::Exited).await;
                                bus.publish(Event::PaneClosed {
                                    pane_id,
                                    reason: CloseReason::Exited,
                                });
                            }
                            break;
                        }
                    }
                }
            }
            debug!(pane_id = %pane_id, "forwarder stopped");
        })
    }

    /// Cancel a pane's forwarder and wait for it to finish, guaranteeing
    /// no further `PaneOutput` after this returns.
    async fn stop_forwarder(&self, pane_id: PaneId) {
        let handle = {
            let mut runtimes = self.runtimes.lock().unwrap();
            match runtimes.get_mut(&pane_id) {
                Some(runtime) => {
                    runtime.cancel.cancel();
                    runtime.forwarder.take()
                }
                None => None,
            }
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn take_closed_flag(&self, pane_id: PaneId) -> Option<Arc<AtomicBool>> {
        self.runtimes
            .lock()
            .unwrap()
            .remove(&pane_id)
            .map(|r| r.closed)
    }

    /// Claim the single `PaneClosed` emission for this pane. Returns true
    /// when this caller is the first to observe the close. Panes restored
    /// from a snapshot have no runtime entry; their close is unclaimed by
    /// definition.
    fn mark_closed(&self, pane_id: PaneId) -> bool {
        match self.take_closed_flag(pane_id) {
            Some(closed) => !closed.swap(true, Ordering::SeqCst),
            None => true,
        }
    }

    // -----------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------

    /// Stop background tasks, flush state, and release plugin dispatchers.
    /// Live panes are left to the backend's own teardown.
    pub async fn shutdown(&self) -> Result<()> {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        let pane_ids: Vec<PaneId> = self.runtimes.lock().unwrap().keys().copied().collect();
        for pane_id in pane_ids {
            self.stop_forwarder(pane_id).await;
        }
        self.plugins.shutdown();
        self.state.flush().await
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}
