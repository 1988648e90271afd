use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{error, info};

use panemux_types::{Error, Event, Result};

use crate::bus::{EventBus, OverflowPolicy};

/// Capabilities a plugin may require at registration time.
///
/// The host grants a set at construction; registering a plugin that
/// requires more is rejected, so a consumer can run untrusted plugins with
/// lifecycle events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Receive session/pane lifecycle and record-change events.
    Lifecycle,
    /// Receive raw pane output bytes (high volume).
    PaneOutput,
    /// Expose named commands for external invocation.
    Commands,
}

/// A plugin is a bus subscriber plus optional named command entry points.
///
/// `on_event` runs on the plugin's own dispatch task: an error is logged
/// and isolated, and a panic kills only that plugin's task — delivery to
/// other plugins and the host itself are unaffected.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;

    /// Names of the commands this plugin handles.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    async fn invoke(
        &self,
        command: &str,
        _args: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("plugin '{}' has no command '{command}'", self.name())
    }
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    task: JoinHandle<()>,
}

/// Registry and dispatcher for plugins.
///
/// Each registered plugin gets its own bus subscription and dispatch task,
/// so one slow or broken plugin never stalls delivery to the others.
pub struct PluginHost {
    bus: EventBus,
    granted: HashSet<Capability>,
    queue_depth: usize,
    entries: RwLock<Vec<PluginEntry>>,
}

impl PluginHost {
    pub fn new(
        bus: EventBus,
        granted: impl IntoIterator<Item = Capability>,
        queue_depth: usize,
    ) -> Self {
        Self {
            bus,
            granted: granted.into_iter().collect(),
            queue_depth,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a plugin and start its dispatch loop.
    ///
    /// Must be called from within a tokio runtime. Fails when the plugin
    /// requires a capability the host does not grant.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        for capability in plugin.capabilities() {
            if !self.granted.contains(capability) {
                return Err(Error::backend(
                    "register_plugin",
                    "plugin-host",
                    format!(
                        "plugin '{}' requires capability {capability:?} which is not granted",
                        plugin.name()
                    ),
                ));
            }
        }

        let wants_output = plugin.capabilities().contains(&Capability::PaneOutput);
        let mut rx = self
            .bus
            .subscribe_with(plugin.name(), self.queue_depth, OverflowPolicy::DropNewest)
            .into_receiver();

        let dispatch_plugin = Arc::clone(&plugin);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, Event::PaneOutput { .. }) && !wants_output {
                    continue;
                }
                if let Err(err) = dispatch_plugin.on_event(&event).await {
                    error!(
                        plugin = dispatch_plugin.name(),
                        event = event.name(),
                        error = %err,
                        "plugin event handler failed"
                    );
                }
            }
        });

        info!(plugin = plugin.name(), "plugin registered");
        self.entries.write().unwrap().push(PluginEntry { plugin, task });
        Ok(())
    }

    /// Invoke a named command on a registered plugin.
    pub async fn invoke(
        &self,
        plugin_name: &str,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let plugin = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .map(|e| Arc::clone(&e.plugin))
                .find(|p| p.name() == plugin_name)
        }
        .ok_or_else(|| Error::not_found("plugin", plugin_name))?;

        if !plugin.commands().iter().any(|c| c == command) {
            return Err(Error::not_found("command", command));
        }

        plugin
            .invoke(command, args)
            .await
            .map_err(|e| Error::backend("invoke_command", "plugin-host", e))
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|e| e.plugin.name().to_string())
            .collect()
    }

    /// Stop all dispatch tasks. Registered plugins are dropped.
    pub fn shutdown(&self) {
        for entry in self.entries.write().unwrap().drain(..) {
            entry.task.abort();
        }
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use panemux_types::SessionId;

    struct CountingPlugin {
        name: String,
        caps: Vec<Capability>,
        seen: AtomicUsize,
        fail: bool,
    }

    impl CountingPlugin {
        fn new(name: &str, caps: Vec<Capability>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                caps,
                seen: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                caps: vec![Capability::Lifecycle],
                seen: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }

        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("intentional failure");
            }
            Ok(())
        }

        fn commands(&self) -> Vec<String> {
            vec!["ping".to_string()]
        }

        async fn invoke(
            &self,
            command: &str,
            args: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            match command {
                "ping" => Ok(serde_json::json!({ "pong": args })),
                other => anyhow::bail!("no such command: {other}"),
            }
        }
    }

    fn lifecycle_event() -> Event {
        Event::SessionCreated {
            session_id: SessionId::new(),
            name: "demo".to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn events_reach_registered_plugins() {
        let bus = EventBus::new(16);
        let host = PluginHost::new(bus.clone(), [Capability::Lifecycle], 16);
        let plugin = CountingPlugin::new("watcher", vec![Capability::Lifecycle]);
        host.register(Arc::clone(&plugin) as Arc<dyn Plugin>).unwrap();

        bus.publish(lifecycle_event());
        settle().await;

        assert_eq!(plugin.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ungranted_capability_rejects_registration() {
        let bus = EventBus::new(16);
        let host = PluginHost::new(bus, [Capability::Lifecycle], 16);
        let plugin = CountingPlugin::new("greedy", vec![Capability::PaneOutput]);

        let err = host.register(plugin as Arc<dyn Plugin>).unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(host.plugin_names().is_empty());
    }

    #[tokio::test]
    async fn failing_plugin_does_not_block_others() {
        let bus = EventBus::new(16);
        let host = PluginHost::new(bus.clone(), [Capability::Lifecycle], 16);
        let bad = CountingPlugin::failing("bad");
        let good = CountingPlugin::new("good", vec![Capability::Lifecycle]);
        host.register(Arc::clone(&bad) as Arc<dyn Plugin>).unwrap();
        host.register(Arc::clone(&good) as Arc<dyn Plugin>).unwrap();

        bus.publish(lifecycle_event());
        bus.publish(lifecycle_event());
        settle().await;

        assert_eq!(bad.seen.load(Ordering::SeqCst), 2);
        assert_eq!(good.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pane_output_is_filtered_without_the_capability() {
        let bus = EventBus::new(16);
        let host = PluginHost::new(bus.clone(), [Capability::Lifecycle], 16);
        let plugin = CountingPlugin::new("lifecycle-only", vec![Capability::Lifecycle]);
        host.register(Arc::clone(&plugin) as Arc<dyn Plugin>).unwrap();

        bus.publish(Event::PaneOutput {
            pane_id: panemux_types::PaneId::new(),
            bytes: b"noise".to_vec(),
        });
        bus.publish(lifecycle_event());
        settle().await;

        assert_eq!(plugin.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_invocation_routes_by_name() {
        let bus = EventBus::new(16);
        let host = PluginHost::new(bus, [Capability::Lifecycle, Capability::Commands], 16);
        let plugin = CountingPlugin::new("cmd", vec![Capability::Commands]);
        host.register(plugin as Arc<dyn Plugin>).unwrap();

        let out = host
            .invoke("cmd", "ping", serde_json::json!(42))
            .await
            .unwrap();
        assert_eq!(out["pong"], 42);

        let err = host
            .invoke("cmd", "missing", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "command", .. }));

        let err = host
            .invoke("ghost", "ping", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "plugin", .. }));
    }
}
