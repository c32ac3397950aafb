use pkg_types::instance::ActionType;
use pkg_types::replication::ReplicationAction;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something observable happened inside the registry.
///
/// Consumers (metrics, cache refresh, watch streams) subscribe to these; the
/// core never calls a metrics API directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// An instance was added, modified or deleted.
    Changed {
        version: u64,
        action: ActionType,
        /// Operation that produced the change.
        operation: ReplicationAction,
        app_name: String,
        instance_id: String,
        replicated: bool,
    },
    Renewed {
        app_name: String,
        instance_id: String,
        replicated: bool,
    },
    Evicted {
        app_name: String,
        instance_id: String,
    },
    EvictionCycle {
        expired: usize,
        evicted: usize,
        suspended: bool,
    },
    SelfPreservationChanged {
        active: bool,
    },
    ReplicationSent {
        peer: String,
        items: usize,
    },
    ReplicationFailed {
        peer: String,
        action: ReplicationAction,
        reason: String,
    },
    ReplicationDropped {
        peer: String,
        items: usize,
    },
    CacheRebuilt {
        version: u64,
    },
}

impl RegistryEvent {
    /// True for events that change what readers can observe.
    pub fn is_change(&self) -> bool {
        matches!(self, RegistryEvent::Changed { .. } | RegistryEvent::Evicted { .. })
    }
}

/// Broadcast fan-out of registry events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event (ignored if nobody is listening).
    pub fn emit(&self, event: RegistryEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(pkg_constants::registry::EVENT_CHANNEL_CAPACITY)
    }
}
