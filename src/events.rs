//! VM lifecycle event bus.
//!
//! Bounded pub/sub used to fan lifecycle transitions out to event-stream
//! subscribers. Each subscriber gets its own 100-slot channel; broadcasts
//! never block, so a subscriber that stops draining loses events instead of
//! stalling the orchestrator.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::grpc::pb::VmEvent;

/// Seconds since the Unix epoch, for event and record timestamps.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-subscriber channel capacity.
pub const EVENT_BUFFER: usize = 100;

/// Broadcasts [`VmEvent`]s to registered subscribers.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, mpsc::Sender<VmEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber and return its receiving end.
    ///
    /// Re-subscribing with an id that is already registered replaces the old
    /// channel; the previous receiver observes end-of-stream.
    pub fn subscribe(&self, id: impl Into<String>) -> mpsc::Receiver<VmEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut subscribers = self.subscribers.write();
        subscribers.insert(id.into(), tx);
        rx
    }

    /// Remove a subscriber, closing its channel.
    pub fn unsubscribe(&self, id: &str) {
        let mut subscribers = self.subscribers.write();
        subscribers.remove(id);
    }

    /// Send an event to every subscriber without blocking.
    ///
    /// A full subscriber channel drops this event for that subscriber only.
    pub fn broadcast(&self, event: VmEvent) {
        let subscribers = self.subscribers.read();
        for (id, tx) in subscribers.iter() {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::warn!(
                    subscriber_id = %id,
                    vm_id = %event.vm_id,
                    error = %e,
                    "event dropped: subscriber not keeping up"
                );
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::pb::{EventType, VmState};

    fn event(vm_id: &str) -> VmEvent {
        VmEvent {
            vm_id: vm_id.to_string(),
            state: VmState::Running as i32,
            message: "VM created successfully".to_string(),
            timestamp: 0,
            r#type: EventType::Created as i32,
        }
    }

    #[tokio::test]
    async fn test_subscribe_receive_unsubscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("sub-1");
        assert_eq!(bus.subscriber_count(), 1);

        bus.broadcast(event("vm-1"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.vm_id, "vm-1");

        bus.unsubscribe("sub-1");
        assert_eq!(bus.subscriber_count(), 0);
        // Channel is closed once the sender is dropped.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resubscribe_reopens_fresh_channel() {
        let bus = EventBus::new();
        let mut old_rx = bus.subscribe("sub-1");
        let mut new_rx = bus.subscribe("sub-1");
        assert_eq!(bus.subscriber_count(), 1);

        bus.broadcast(event("vm-1"));
        assert!(old_rx.recv().await.is_none());
        assert_eq!(new_rx.recv().await.unwrap().vm_id, "vm-1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe("slow");
        let mut fast = bus.subscribe("fast");

        // Fill both buffers to capacity.
        for i in 0..EVENT_BUFFER {
            bus.broadcast(event(&format!("vm-{}", i)));
        }

        // The fast subscriber keeps draining; the slow one never does.
        let mut fast_count = 0;
        while fast.try_recv().is_ok() {
            fast_count += 1;
        }
        assert_eq!(fast_count, EVENT_BUFFER);

        // The overflow event is dropped for the slow subscriber only.
        bus.broadcast(event("overflow"));
        assert_eq!(fast.try_recv().unwrap().vm_id, "overflow");

        let mut slow_ids = Vec::new();
        while let Ok(ev) = slow.try_recv() {
            slow_ids.push(ev.vm_id);
        }
        assert_eq!(slow_ids.len(), EVENT_BUFFER);
        assert!(!slow_ids.contains(&"overflow".to_string()));
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.broadcast(event("vm-before"));

        let mut rx = bus.subscribe("late");
        bus.broadcast(event("vm-after"));

        assert_eq!(rx.recv().await.unwrap().vm_id, "vm-after");
        assert!(rx.try_recv().is_err());
    }
}
