//! Durability across manager restarts and plugin-host integration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use panemux_manager::{
    Capability, Config, Event, JsonFileStore, MockBackend, PaneSpec, PaneStatus, Plugin,
    SqliteStore, StateStore, TerminalManager,
};

fn test_config() -> Config {
    Config {
        liveness_poll_ms: 50,
        flush_interval_ms: 10,
        ..Config::default()
    }
}

fn manager_with_store(store: Arc<dyn StateStore>) -> Arc<TerminalManager> {
    let config = test_config();
    let mock = Arc::new(MockBackend::new(&config));
    TerminalManager::with_backend(mock, store, config).unwrap()
}

#[tokio::test]
async fn state_survives_restart_with_json_store() {
    let dir = tempfile::tempdir().unwrap();
    let (session_id, pane_id) = {
        let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
        let manager = manager_with_store(store);
        let session = manager.create_session("persist", None).await.unwrap();
        let pane = manager
            .create_pane(session.id, None, &PaneSpec::default())
            .await
            .unwrap();
        manager.shutdown().await.unwrap();
        (session.id, pane.id)
    };

    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let manager = manager_with_store(store);
    assert!(manager.restore_from_store().await.unwrap());

    let session = manager.get_session(session_id).await.unwrap();
    assert_eq!(session.name, "persist");

    // The restarted backend knows nothing of the old pane; the record is
    // reconciled to exited instead of assumed live.
    let pane = manager.get_pane(pane_id).await.unwrap();
    assert_eq!(pane.status, PaneStatus::Exited);
}

#[tokio::test]
async fn state_survives_restart_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("panemux.db");

    let session_id = {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let manager = manager_with_store(store);
        let session = manager.create_session("embedded", None).await.unwrap();
        manager.shutdown().await.unwrap();
        session.id
    };

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let manager = manager_with_store(store);
    assert!(manager.restore_from_store().await.unwrap());
    assert_eq!(
        manager.get_session(session_id).await.unwrap().name,
        "embedded"
    );
}

#[tokio::test]
async fn unflushed_mutations_are_recovered_from_the_journal() {
    let dir = tempfile::tempdir().unwrap();
    let session_id = {
        // Flush interval far beyond the test lifetime: only the journal
        // can carry this session across the restart.
        let config = Config {
            flush_interval_ms: 3_600_000,
            ..test_config()
        };
        let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
        let mock = Arc::new(MockBackend::new(&config));
        let manager = TerminalManager::with_backend(mock, store, config).unwrap();
        let session = manager.create_session("journaled", None).await.unwrap();
        // No shutdown flush either: drop the manager cold.
        session.id
    };

    let store = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let manager = manager_with_store(store);
    assert!(manager.restore_from_store().await.unwrap());
    assert_eq!(
        manager.get_session(session_id).await.unwrap().name,
        "journaled"
    );
}

struct RecorderPlugin {
    lifecycle_events: AtomicUsize,
}

#[async_trait]
impl Plugin for RecorderPlugin {
    fn name(&self) -> &str {
        "recorder"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Lifecycle, Capability::Commands]
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::SessionCreated { .. } | Event::PaneCreated { .. } => {
                self.lifecycle_events.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    fn commands(&self) -> Vec<String> {
        vec!["count".to_string()]
    }

    async fn invoke(
        &self,
        command: &str,
        _args: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        match command {
            "count" => Ok(serde_json::json!(
                self.lifecycle_events.load(Ordering::SeqCst)
            )),
            other => anyhow::bail!("unknown command: {other}"),
        }
    }
}

#[tokio::test]
async fn plugins_observe_lifecycle_and_answer_commands() {
    let store = Arc::new(panemux_manager::MemoryStore::new());
    let manager = manager_with_store(store);

    let plugin = Arc::new(RecorderPlugin {
        lifecycle_events: AtomicUsize::new(0),
    });
    manager.register_plugin(plugin).unwrap();

    let session = manager.create_session("observed", None).await.unwrap();
    manager
        .create_pane(session.id, None, &PaneSpec::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let count = manager
        .invoke_plugin("recorder", "count", serde_json::Value::Null)
        .await
        .unwrap();
    assert_eq!(count, serde_json::json!(2));
}
