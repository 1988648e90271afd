use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use panemux_events::EventBus;
use panemux_types::{
    Error, Event, Layout, PaneId, PaneRecord, PaneSize, PaneStatus, RecordKind, Result,
    SessionId, SessionRecord, WindowId, WindowRecord,
};

use crate::snapshot::Snapshot;
use crate::store::{JournalEntry, StateStore};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionRecord>,
    windows: HashMap<WindowId, WindowRecord>,
    panes: HashMap<PaneId, PaneRecord>,
}

impl Tables {
    fn to_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::empty();
        snapshot.saved_at = Utc::now();
        snapshot.sessions = self.sessions.values().cloned().collect();
        snapshot.windows = self.windows.values().cloned().collect();
        snapshot.panes = self.panes.values().cloned().collect();
        snapshot.sessions.sort_by_key(|s| s.created_at);
        snapshot.panes.sort_by_key(|p| p.created_at);
        snapshot
    }

    fn install(&mut self, snapshot: Snapshot) {
        self.sessions = snapshot.sessions.into_iter().map(|s| (s.id, s)).collect();
        self.windows = snapshot.windows.into_iter().map(|w| (w.id, w)).collect();
        self.panes = snapshot.panes.into_iter().map(|p| (p.id, p)).collect();
    }
}

fn upsert(kind: RecordKind, id: String, value: &impl serde::Serialize) -> Result<JournalEntry> {
    Ok(JournalEntry {
        timestamp: Utc::now(),
        kind,
        id,
        value: Some(
            serde_json::to_value(value)
                .map_err(|e| Error::storage(format!("failed to serialize record: {e}")))?,
        ),
    })
}

fn deletion(kind: RecordKind, id: String) -> JournalEntry {
    JournalEntry {
        timestamp: Utc::now(),
        kind,
        id,
        value: None,
    }
}

/// Authoritative record store for sessions, windows, and panes.
///
/// All mutations run under one async lock: same-entity writes are strictly
/// serialized, and each mutation journals its entries to the store before
/// the call returns (write-ahead). Every committed mutation is announced on
/// the bus as `RecordChanged`, so other components stay in sync without
/// polling. Records hold ids only — never references to each other — and
/// are resolved through the maps here.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    tables: Mutex<Tables>,
    dirty: AtomicBool,
}

impl StateManager {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            tables: Mutex::new(Tables::default()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Journal the batch, then apply and announce. The lock is held across
    /// the append so a competing writer cannot interleave.
    async fn commit(
        &self,
        tables: &mut Tables,
        entries: Vec<JournalEntry>,
        apply: impl FnOnce(&mut Tables),
        events: Vec<Event>,
    ) -> Result<()> {
        self.store.append(&entries).await?;
        apply(tables);
        self.dirty.store(true, Ordering::Release);
        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Insert a session record. The id is whatever the backend assigned at
    /// creation; the state layer never invents session identities.
    pub async fn create_session_record(&self, record: SessionRecord) -> Result<SessionRecord> {
        let mut tables = self.tables.lock().await;

        let entries = vec![upsert(RecordKind::Session, record.id.to_string(), &record)?];
        let event = Event::RecordChanged {
            kind: RecordKind::Session,
            id: record.id.to_string(),
            version: record.version,
            value: Some(serde_json::to_value(&record).unwrap_or_default()),
        };
        let stored = record.clone();
        self.commit(
            &mut tables,
            entries,
            |t| {
                t.sessions.insert(stored.id, stored);
            },
            vec![event],
        )
        .await?;

        Ok(record)
    }

    pub async fn create_window_record(
        &self,
        session_id: SessionId,
        layout: Layout,
    ) -> Result<WindowRecord> {
        let mut tables = self.tables.lock().await;
        let mut session = tables
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))?;

        let window = WindowRecord::new(session_id, layout);
        session.windows.push(window.id);
        session.version += 1;

        let entries = vec![
            upsert(RecordKind::Window, window.id.to_string(), &window)?,
            upsert(RecordKind::Session, session.id.to_string(), &session)?,
        ];
        let events = vec![
            Event::RecordChanged {
                kind: RecordKind::Window,
                id: window.id.to_string(),
                version: window.version,
                value: Some(serde_json::to_value(&window).unwrap_or_default()),
            },
            Event::RecordChanged {
                kind: RecordKind::Session,
                id: session.id.to_string(),
                version: session.version,
                value: Some(serde_json::to_value(&session).unwrap_or_default()),
            },
        ];

        let (window_clone, session_clone) = (window.clone(), session.clone());
        self.commit(
            &mut tables,
            entries,
            |t| {
                t.windows.insert(window_clone.id, window_clone);
                t.sessions.insert(session_clone.id, session_clone);
            },
            events,
        )
        .await?;

        Ok(window)
    }

    /// Insert a pane record built by the composition root. The owning
    /// session and window must already exist; the window's pane list and
    /// version advance in the same transaction.
    pub async fn create_pane_record(&self, pane: PaneRecord) -> Result<PaneRecord> {
        let mut tables = self.tables.lock().await;

        if !tables.sessions.contains_key(&pane.session_id) {
            return Err(Error::not_found("session", pane.session_id));
        }
        let mut window = tables
            .windows
            .get(&pane.window_id)
            .cloned()
            .ok_or_else(|| Error::not_found("window", pane.window_id))?;
        window.panes.push(pane.id);
        window.version += 1;

        let entries = vec![
            upsert(RecordKind::Pane, pane.id.to_string(), &pane)?,
            upsert(RecordKind::Window, window.id.to_string(), &window)?,
        ];
        let events = vec![
            Event::RecordChanged {
                kind: RecordKind::Pane,
                id: pane.id.to_string(),
                version: pane.version,
                value: Some(serde_json::to_value(&pane).unwrap_or_default()),
            },
            Event::RecordChanged {
                kind: RecordKind::Window,
                id: window.id.to_string(),
                version: window.version,
                value: Some(serde_json::to_value(&window).unwrap_or_default()),
            },
        ];

        let (pane_clone, window_clone) = (pane.clone(), window.clone());
        self.commit(
            &mut tables,
            entries,
            |t| {
                t.panes.insert(pane_clone.id, pane_clone);
                t.windows.insert(window_clone.id, window_clone);
            },
            events,
        )
        .await?;

        Ok(pane)
    }

    /// Optimistic conditional update: rejects a stale base version with
    /// `Error::Conflict` instead of silently applying last-writer-wins.
    pub async fn update_pane_record(
        &self,
        pane_id: PaneId,
        expected_version: u64,
        mutate: impl FnOnce(&mut PaneRecord),
    ) -> Result<PaneRecord> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .panes
            .get(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;

        if current.version != expected_version {
            return Err(Error::Conflict {
                entity: format!("pane {pane_id}"),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut updated = current.clone();
        mutate(&mut updated);
        updated.version = expected_version + 1;
        self.commit_pane(&mut tables, updated.clone()).await?;
        Ok(updated)
    }

    /// Engine-internal transition: serialized by the table lock, so no
    /// version argument is needed and no conflict is possible.
    pub async fn transition_pane(
        &self,
        pane_id: PaneId,
        status: PaneStatus,
    ) -> Result<PaneRecord> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .panes
            .get(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;

        if current.status == status {
            return Ok(current.clone());
        }
        let mut updated = current.clone();
        updated.status = status;
        updated.version += 1;
        self.commit_pane(&mut tables, updated.clone()).await?;
        Ok(updated)
    }

    /// Engine-internal size update after a successful backend resize.
    pub async fn update_pane_size(&self, pane_id: PaneId, size: PaneSize) -> Result<PaneRecord> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .panes
            .get(&pane_id)
            .ok_or_else(|| Error::not_found("pane", pane_id))?;

        let mut updated = current.clone();
        updated.size = size;
        updated.version += 1;
        self.commit_pane(&mut tables, updated.clone()).await?;
        Ok(updated)
    }

    async fn commit_pane(&self, tables: &mut Tables, pane: PaneRecord) -> Result<()> {
        let entries = vec![upsert(RecordKind::Pane, pane.id.to_string(), &pane)?];
        let event = Event::RecordChanged {
            kind: RecordKind::Pane,
            id: pane.id.to_string(),
            version: pane.version,
            value: Some(serde_json::to_value(&pane).unwrap_or_default()),
        };
        self.commit(
            tables,
            entries,
            |t| {
                t.panes.insert(pane.id, pane);
            },
            vec![event],
        )
        .await
    }

    pub async fn rename_session(&self, session_id: SessionId, name: &str) -> Result<SessionRecord> {
        let mut tables = self.tables.lock().await;
        let current = tables
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;

        let mut updated = current.clone();
        updated.name = name.to_string();
        updated.version += 1;

        let entries = vec![upsert(RecordKind::Session, updated.id.to_string(), &updated)?];
        let event = Event::RecordChanged {
            kind: RecordKind::Session,
            id: updated.id.to_string(),
            version: updated.version,
            value: Some(serde_json::to_value(&updated).unwrap_or_default()),
        };
        let stored = updated.clone();
        self.commit(
            &mut tables,
            entries,
            |t| {
                t.sessions.insert(stored.id, stored);
            },
            vec![event],
        )
        .await?;
        Ok(updated)
    }

    /// Remove a session and every descendant window and pane in one
    /// transaction. Panes are soft-marked `Killed` in the returned records
    /// so late readers of the cascade see a terminal state.
    pub async fn delete_session_cascade(&self, session_id: SessionId) -> Result<Vec<PaneRecord>> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))?;

        let window_ids = session.windows.clone();
        let pane_ids: Vec<PaneId> = tables
            .panes
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.id)
            .collect();

        let mut entries = Vec::new();
        let mut events = Vec::new();
        for pane_id in &pane_ids {
            entries.push(deletion(RecordKind::Pane, pane_id.to_string()));
            events.push(Event::RecordChanged {
                kind: RecordKind::Pane,
                id: pane_id.to_string(),
                version: 0,
                value: None,
            });
        }
        for window_id in &window_ids {
            entries.push(deletion(RecordKind::Window, window_id.to_string()));
            events.push(Event::RecordChanged {
                kind: RecordKind::Window,
                id: window_id.to_string(),
                version: 0,
                value: None,
            });
        }
        entries.push(deletion(RecordKind::Session, session_id.to_string()));
        events.push(Event::RecordChanged {
            kind: RecordKind::Session,
            id: session_id.to_string(),
            version: 0,
            value: None,
        });

        let mut removed = Vec::new();
        self.commit(
            &mut tables,
            entries,
            |t| {
                for pane_id in &pane_ids {
                    if let Some(mut pane) = t.panes.remove(pane_id) {
                        if !pane.status.is_terminal() {
                            pane.status = PaneStatus::Killed;
                        }
                        removed.push(pane);
                    }
                }
                for window_id in &window_ids {
                    t.windows.remove(window_id);
                }
                t.sessions.remove(&session_id);
            },
            events,
        )
        .await?;

        debug!(session_id = %session_id, panes = removed.len(), "session cascade deleted");
        Ok(removed)
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionRecord> {
        self.tables
            .lock()
            .await
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    pub async fn get_window(&self, window_id: WindowId) -> Result<WindowRecord> {
        self.tables
            .lock()
            .await
            .windows
            .get(&window_id)
            .cloned()
            .ok_or_else(|| Error::not_found("window", window_id))
    }

    pub async fn get_pane(&self, pane_id: PaneId) -> Result<PaneRecord> {
        self.tables
            .lock()
            .await
            .panes
            .get(&pane_id)
            .cloned()
            .ok_or_else(|| Error::not_found("pane", pane_id))
    }

    pub async fn list_sessions(&self) -> Vec<SessionRecord> {
        let tables = self.tables.lock().await;
        let mut sessions: Vec<SessionRecord> = tables.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn session_panes(&self, session_id: SessionId) -> Vec<PaneRecord> {
        let tables = self.tables.lock().await;
        let mut panes: Vec<PaneRecord> = tables
            .panes
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        panes.sort_by_key(|p| p.created_at);
        panes
    }

    pub async fn list_panes(&self) -> Vec<PaneRecord> {
        let tables = self.tables.lock().await;
        tables.panes.values().cloned().collect()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.tables.lock().await.to_snapshot()
    }

    /// Replace all tables with the snapshot's records and persist it as the
    /// new compaction point.
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.store.persist_snapshot(&snapshot).await?;
        tables.install(snapshot);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Load the store's latest snapshot into the tables, if one exists.
    pub async fn load_from_store(&self) -> Result<bool> {
        match self.store.load().await? {
            Some(snapshot) => {
                self.tables.lock().await.install(snapshot);
                self.dirty.store(false, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush the current tables to the store if anything changed.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.tables.lock().await.to_snapshot();
        self.store.persist_snapshot(&snapshot).await
    }

    /// Periodic snapshot flush (journal compaction). Abort the handle to
    /// stop; a final explicit `flush` at shutdown picks up the remainder.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.flush().await {
                    error!(error = %err, "state flush failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use panemux_types::Layout;
    use pretty_assertions::assert_eq;

    fn manager() -> Arc<StateManager> {
        let bus = EventBus::new(64);
        Arc::new(StateManager::new(Arc::new(MemoryStore::new()), bus))
    }

    async fn seeded(manager: &StateManager) -> PaneRecord {
        let session = manager
            .create_session_record(SessionRecord::new("demo"))
            .await
            .unwrap();
        let window = manager
            .create_window_record(session.id, Layout::default())
            .await
            .unwrap();
        let pane = PaneRecord::new(
            PaneId::new(),
            session.id,
            window.id,
            "%0",
            "/tmp".into(),
            "/bin/sh",
            PaneSize::default(),
        );
        manager.create_pane_record(pane).await.unwrap()
    }

    #[tokio::test]
    async fn records_link_by_id_not_reference() {
        let manager = manager();
        let pane = seeded(&manager).await;

        let session = manager.get_session(pane.session_id).await.unwrap();
        let window = manager.get_window(pane.window_id).await.unwrap();
        assert_eq!(window.session_id, session.id);
        assert_eq!(window.panes, vec![pane.id]);
        assert_eq!(session.windows, vec![window.id]);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let manager = manager();
        let pane = seeded(&manager).await;

        let first = manager
            .update_pane_record(pane.id, pane.version, |p| p.status = PaneStatus::Running)
            .await
            .unwrap();
        assert_eq!(first.version, pane.version + 1);

        let err = manager
            .update_pane_record(pane.id, pane.version, |p| p.status = PaneStatus::Error)
            .await
            .unwrap_err();
        match err {
            Error::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, pane.version);
                assert_eq!(actual, first.version);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The losing write must not have mutated anything.
        let current = manager.get_pane(pane.id).await.unwrap();
        assert_eq!(current.status, PaneStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_updates_one_wins_one_conflicts() {
        let manager = manager();
        let pane = seeded(&manager).await;
        let base = pane.version;

        let (a, b) = tokio::join!(
            manager.update_pane_record(pane.id, base, |p| p.status = PaneStatus::Running),
            manager.update_pane_record(pane.id, base, |p| p.status = PaneStatus::Error),
        );

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(
            outcomes.iter().filter(|ok| **ok).count(),
            1,
            "exactly one writer must win: {outcomes:?}"
        );
        let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(conflict, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn cascade_removes_all_descendants() {
        let manager = manager();
        let pane = seeded(&manager).await;

        let removed = manager
            .delete_session_cascade(pane.session_id)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].status.is_terminal());

        assert!(manager.get_session(pane.session_id).await.is_err());
        assert!(manager.get_window(pane.window_id).await.is_err());
        assert!(manager.get_pane(pane.id).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let manager = manager();
        let pane = seeded(&manager).await;
        let snapshot = manager.snapshot().await;

        let fresh = self::manager();
        fresh.restore(snapshot.clone()).await.unwrap();

        assert_eq!(fresh.snapshot().await.sessions, snapshot.sessions);
        assert_eq!(fresh.get_pane(pane.id).await.unwrap(), pane);
    }

    #[tokio::test]
    async fn mutations_announce_record_changes() {
        let bus = EventBus::new(64);
        let mut sub = bus.subscribe("watcher");
        let manager = Arc::new(StateManager::new(Arc::new(MemoryStore::new()), bus));

        manager
            .create_session_record(SessionRecord::new("announced"))
            .await
            .unwrap();

        match sub.recv().await.unwrap() {
            Event::RecordChanged { kind, value, .. } => {
                assert_eq!(kind, RecordKind::Session);
                assert!(value.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_owner_rejected_on_pane_creation() {
        let manager = manager();
        let pane = PaneRecord::new(
            PaneId::new(),
            SessionId::new(),
            panemux_types::WindowId::new(),
            "%9",
            "/tmp".into(),
            "/bin/sh",
            PaneSize::default(),
        );
        let err = manager.create_pane_record(pane).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "session", .. }));
    }
}
