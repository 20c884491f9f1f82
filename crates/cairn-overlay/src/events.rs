//! Typed event surface for upper layers.
//!
//! Observers subscribe explicitly and receive events over an unbounded
//! channel; dropping the receiver (or calling unsubscribe) removes the
//! subscription. Emission never blocks overlay progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cairn_core::distance::{ContentId, NodeId};
use cairn_core::wire::ProtocolId;
use tokio::sync::mpsc;

/// Handle returned by subscribe; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observations exposed to upper layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    NodeAdded {
        node_id: NodeId,
        protocol: ProtocolId,
    },
    NodeRemoved {
        node_id: NodeId,
        protocol: ProtocolId,
    },
    ContentAdded {
        protocol: ProtocolId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Verified {
        content_id: ContentId,
        ok: bool,
    },
}

/// Registry of event subscribers, shared across the node's overlays.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<OverlayEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .insert(id, tx);
        (SubscriptionId(id), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .remove(&id.0);
    }

    /// Deliver an event to every live subscriber; closed receivers are
    /// pruned as they are discovered.
    pub fn emit(&self, event: OverlayEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_added(tail: u8) -> OverlayEvent {
        let mut id = [0u8; 32];
        id[31] = tail;
        OverlayEvent::NodeAdded {
            node_id: id,
            protocol: ProtocolId::History,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let (_id_a, mut rx_a) = bus.subscribe();
        let (_id_b, mut rx_b) = bus.subscribe();

        bus.emit(node_added(1));
        assert_eq!(rx_a.recv().await, Some(node_added(1)));
        assert_eq!(rx_b.recv().await, Some(node_added(1)));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        bus.emit(node_added(2));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_emit() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe();
        drop(rx);
        bus.emit(node_added(3));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
