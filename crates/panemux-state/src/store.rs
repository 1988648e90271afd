use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use panemux_types::{Error, RecordKind, Result};

use crate::snapshot::Snapshot;

/// One committed mutation, written ahead of the acknowledgement.
///
/// `value` carries the record's new serialized form; `None` is a deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub id: String,
    pub value: Option<serde_json::Value>,
}

/// Storage contract shared by every backend: an acknowledged `append`
/// survives a process restart unless the store is explicitly memory-only,
/// and `load` returns the latest snapshot with the journal tail replayed.
///
/// A batch handed to `append` is atomic: either every entry of a cascade
/// is durable or none is.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn append(&self, entries: &[JournalEntry]) -> Result<()>;

    /// Replace the durable snapshot and compact the journal.
    async fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn load(&self) -> Result<Option<Snapshot>>;

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Ephemeral store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: StdMutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn append(&self, _entries: &[JournalEntry]) -> Result<()> {
        Ok(())
    }

    async fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// JSON files
// ---------------------------------------------------------------------------

/// File-backed store: an atomic `state.json` snapshot plus a
/// `journal.jsonl` write-ahead tail, both under one directory.
pub struct JsonFileStore {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    /// Serializes journal appends against snapshot compaction.
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            snapshot_path: dir.join("state.json"),
            journal_path: dir.join("journal.jsonl"),
            io_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.io_lock.lock().await;

        let mut buf = Vec::new();
        for entry in entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| Error::storage(format!("failed to serialize journal entry: {e}")))?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .await?;
        // One write per batch keeps a cascade's entries contiguous.
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.io_lock.lock().await;

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::storage(format!("failed to serialize snapshot: {e}")))?;

        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = self.snapshot_path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;

        // The snapshot now covers everything journaled so far.
        tokio::fs::write(&self.journal_path, b"").await?;
        debug!(path = %self.snapshot_path.display(), "snapshot flushed");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let _guard = self.io_lock.lock().await;

        let mut snapshot = match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::storage(format!("corrupt snapshot file: {e}")))?;
                Some(Snapshot::from_json(value)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match tokio::fs::read_to_string(&self.journal_path).await {
            Ok(text) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    let entry: JournalEntry = serde_json::from_str(line)
                        .map_err(|e| Error::storage(format!("corrupt journal line: {e}")))?;
                    snapshot
                        .get_or_insert_with(Snapshot::empty)
                        .apply(&entry)?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(snapshot)
    }

    fn name(&self) -> &'static str {
        "json-file"
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Embedded-database store. All rusqlite work runs on the blocking pool so
/// durable flushes never occupy an async worker thread.
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                saved_at TEXT NOT NULL,
                document TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                entry TEXT NOT NULL
            );",
        )
        .map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::storage(format!("blocking task failed: {e}")))?
    }
}

fn sqlite_err(e: rusqlite::Error) -> Error {
    Error::storage(format!("sqlite: {e}"))
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, String)> = entries
            .iter()
            .map(|entry| {
                serde_json::to_string(entry)
                    .map(|json| (entry.timestamp.to_rfc3339(), json))
                    .map_err(|e| Error::storage(format!("failed to serialize journal entry: {e}")))
            })
            .collect::<Result<_>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            for (timestamp, json) in &rows {
                tx.execute(
                    "INSERT INTO journal (timestamp, entry) VALUES (?1, ?2)",
                    params![timestamp, json],
                )
                .map_err(sqlite_err)?;
            }
            tx.commit().map_err(sqlite_err)
        })
        .await
    }

    async fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let saved_at = snapshot.saved_at.to_rfc3339();
        let document = serde_json::to_string(snapshot)
            .map_err(|e| Error::storage(format!("failed to serialize snapshot: {e}")))?;

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (id, saved_at, document) VALUES (1, ?1, ?2)",
                params![saved_at, document],
            )
            .map_err(sqlite_err)?;
            tx.execute("DELETE FROM journal", []).map_err(sqlite_err)?;
            tx.commit().map_err(sqlite_err)
        })
        .await
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            let document: Option<String> = conn
                .query_row("SELECT document FROM snapshots WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(sqlite_err(other)),
                })?;

            let mut snapshot = match document {
                Some(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| Error::storage(format!("corrupt snapshot row: {e}")))?;
                    Some(Snapshot::from_json(value)?)
                }
                None => None,
            };

            let mut stmt = conn
                .prepare("SELECT entry FROM journal ORDER BY seq")
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?;
            for row in rows {
                let text = row.map_err(sqlite_err)?;
                let entry: JournalEntry = serde_json::from_str(&text)
                    .map_err(|e| Error::storage(format!("corrupt journal row: {e}")))?;
                snapshot
                    .get_or_insert_with(Snapshot::empty)
                    .apply(&entry)?;
            }

            Ok(snapshot)
        })
        .await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panemux_types::SessionRecord;

    fn entry_for(session: &SessionRecord) -> JournalEntry {
        JournalEntry {
            timestamp: Utc::now(),
            kind: RecordKind::Session,
            id: session.id.to_string(),
            value: Some(serde_json::to_value(session).unwrap()),
        }
    }

    #[tokio::test]
    async fn memory_store_is_not_durable() {
        let store = MemoryStore::new();
        assert!(!store.is_durable());
        assert!(store.load().await.unwrap().is_none());

        store.persist_snapshot(&Snapshot::empty()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn json_store_replays_journal_past_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionRecord::new("replayed");
        {
            let store = JsonFileStore::new(dir.path()).unwrap();
            store.persist_snapshot(&Snapshot::empty()).await.unwrap();
            store.append(&[entry_for(&session)]).await.unwrap();
        }

        // A fresh store over the same directory sees the journaled record.
        let store = JsonFileStore::new(dir.path()).unwrap();
        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].name, "replayed");
    }

    #[tokio::test]
    async fn json_store_compacts_journal_on_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let session = SessionRecord::new("compacted");

        store.append(&[entry_for(&session)]).await.unwrap();
        let mut snapshot = Snapshot::empty();
        snapshot.sessions.push(session);
        store.persist_snapshot(&snapshot).await.unwrap();

        let journal = std::fs::read_to_string(dir.path().join("journal.jsonl")).unwrap();
        assert!(journal.is_empty());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.sessions.len(), 1);
    }

    #[tokio::test]
    async fn json_store_journal_alone_reconstructs_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let session = SessionRecord::new("wal-only");

        store.append(&[entry_for(&session)]).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.sessions[0].name, "wal-only");
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let session = SessionRecord::new("persisted");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.append(&[entry_for(&session)]).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.sessions[0].name, "persisted");

        // Compaction clears the journal but keeps the state.
        store.persist_snapshot(&snapshot).await.unwrap();
        let reloaded = store.load().await.unwrap().unwrap();
        assert_eq!(reloaded.sessions.len(), 1);
    }

    #[tokio::test]
    async fn deletion_entries_remove_records_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let session = SessionRecord::new("short-lived");

        store.append(&[entry_for(&session)]).await.unwrap();
        store
            .append(&[JournalEntry {
                timestamp: Utc::now(),
                kind: RecordKind::Session,
                id: session.id.to_string(),
                value: None,
            }])
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap().unwrap();
        assert!(snapshot.sessions.is_empty());
    }
}
