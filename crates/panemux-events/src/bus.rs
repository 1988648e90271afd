use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use panemux_types::{Event, ResourceKind};

/// What to do when a subscriber's queue is full at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the event for this subscriber and keep the subscription.
    DropNewest,
    /// Disconnect the subscriber entirely; it has fallen too far behind.
    DropSubscriber,
}

struct SubscriberSlot {
    id: u64,
    name: String,
    tx: mpsc::Sender<Event>,
    policy: OverflowPolicy,
    dropped: u64,
}

/// A subscription handle: a bounded queue of events from publish time on.
pub struct BusSubscriber {
    name: String,
    rx: mpsc::Receiver<Event>,
}

impl BusSubscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Hand the raw receiver to a dispatch loop.
    pub fn into_receiver(self) -> mpsc::Receiver<Event> {
        self.rx
    }
}

/// Fan-out bus. Cheap to clone; all clones share the subscriber registry.
///
/// `publish` is synchronous and never suspends or blocks: delivery is
/// `try_send` per subscriber, with the per-subscription overflow policy
/// deciding what happens to a full queue. Closed receivers are pruned
/// during publish.
#[derive(Clone)]
pub struct EventBus {
    slots: Arc<RwLock<Vec<SubscriberSlot>>>,
    next_id: Arc<AtomicU64>,
    default_capacity: usize,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            slots: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Subscribe with the default queue depth and `DropNewest` overflow.
    pub fn subscribe(&self, name: &str) -> BusSubscriber {
        self.subscribe_with(name, self.default_capacity, OverflowPolicy::DropNewest)
    }

    pub fn subscribe_with(
        &self,
        name: &str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> BusSubscriber {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.write().unwrap().push(SubscriberSlot {
            id,
            name: name.to_string(),
            tx,
            policy,
            dropped: 0,
        });
        BusSubscriber {
            name: name.to_string(),
            rx,
        }
    }

    /// Deliver an event to every live subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        let mut warnings = Vec::new();
        {
            let mut slots = self.slots.write().unwrap();
            slots.retain_mut(|slot| match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Closed(_)) => false,
                Err(TrySendError::Full(_)) => match slot.policy {
                    OverflowPolicy::DropNewest => {
                        slot.dropped += 1;
                        if slot.dropped == 1 {
                            warnings.push(slot.name.clone());
                        }
                        warn!(
                            subscriber = %slot.name,
                            dropped = slot.dropped,
                            event = event.name(),
                            "subscriber queue full, dropping event"
                        );
                        true
                    }
                    OverflowPolicy::DropSubscriber => {
                        warn!(
                            subscriber = %slot.name,
                            subscriber_id = slot.id,
                            "subscriber queue full, disconnecting subscriber"
                        );
                        false
                    }
                },
            });
        }

        // Best-effort pressure signal, outside the lock. Only on the first
        // drop per subscriber, and never for a warning event itself, so a
        // saturated bus cannot recurse into more warnings.
        if !matches!(event, Event::ResourceWarning { .. }) {
            for name in warnings {
                self.publish(Event::ResourceWarning {
                    kind: ResourceKind::SubscriberQueue,
                    detail: format!("subscriber '{name}' is dropping events"),
                });
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.read().unwrap().len()
    }
}
