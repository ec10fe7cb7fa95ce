//! Typed storage events
//!
//! The engine reports state changes through one composed notifier: a
//! broadcast channel of typed events. There is deliberately no second
//! listener registry; subscribers take a receiver and filter.

use crate::types::StorageSpace;
use lib_peer::PeerId;
use tokio::sync::broadcast;

/// Events emitted at the storage engine boundary.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    DataStored {
        key: String,
        space: StorageSpace,
    },
    DataRetrieved {
        key: String,
    },
    DataUpdated {
        key: String,
        value: serde_json::Value,
        version: u64,
    },
    DataDeleted {
        key: String,
        deleted_by: Option<PeerId>,
    },
    AccessGranted {
        key: String,
        peer: PeerId,
    },
    AccessRevoked {
        key: String,
        peer: PeerId,
    },
    StorageEnabled,
    StorageDisabled,
    StorageCleared,
}

impl StorageEvent {
    /// Base key this event concerns, when it concerns one.
    pub fn key(&self) -> Option<&str> {
        match self {
            StorageEvent::DataStored { key, .. }
            | StorageEvent::DataRetrieved { key }
            | StorageEvent::DataUpdated { key, .. }
            | StorageEvent::DataDeleted { key, .. }
            | StorageEvent::AccessGranted { key, .. }
            | StorageEvent::AccessRevoked { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Broadcast notifier for [`StorageEvent`]s.
///
/// Slow receivers lag rather than block the engine; a lagging receiver
/// sees `RecvError::Lagged` and continues from the current tail.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is listening.
    pub fn emit(&self, event: StorageEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(StorageEvent::StorageEnabled);

        assert!(matches!(rx1.recv().await, Ok(StorageEvent::StorageEnabled)));
        assert!(matches!(rx2.recv().await, Ok(StorageEvent::StorageEnabled)));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(StorageEvent::StorageCleared);
    }

    #[test]
    fn test_event_key_accessor() {
        let ev = StorageEvent::DataStored {
            key: "k".into(),
            space: StorageSpace::Public,
        };
        assert_eq!(ev.key(), Some("k"));
        assert_eq!(StorageEvent::StorageEnabled.key(), None);
    }
}
