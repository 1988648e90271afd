//! Typed publish/subscribe distribution and the plugin host.
//!
//! Publishing never blocks the publisher: every subscriber owns a bounded
//! queue and a configured overflow policy. Late subscribers receive no past
//! events; replay lives in state-manager snapshots, not here.

mod bus;
mod plugin;

pub use bus::{BusSubscriber, EventBus, OverflowPolicy};
pub use plugin::{Capability, Plugin, PluginHost};
