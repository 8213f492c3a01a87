//! In-process bus with MQTT-style topic filters.
//!
//! Used when the pipeline runs standalone and in tests. Each subscription gets
//! a bounded crossbeam channel; a full subscriber loses the message rather than
//! blocking the publisher.

use crate::bus::{topic_matches, BusError, BusMessage, BusPublisher};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default queue depth per subscription.
pub const DEFAULT_QUEUE_DEPTH: usize = 10_000;

struct Subscription {
    filters: Vec<String>,
    sender: Sender<BusMessage>,
}

impl Subscription {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(f, topic))
    }
}

/// A local publish/subscribe bus.
pub struct LocalBus {
    subscriptions: Mutex<Vec<Subscription>>,
    queue_depth: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Subscribe to every topic matching any of `filters`.
    pub fn subscribe(&self, filters: &[&str]) -> Receiver<BusMessage> {
        let (sender, receiver) = bounded(self.queue_depth);
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        subscriptions.push(Subscription {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            sender,
        });
        receiver
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Messages queued across all subscriptions and not yet received.
    pub fn pending(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|s| s.sender.len())
            .sum()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPublisher for LocalBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        let mut dropped = 0;

        subscriptions.retain(|subscription| {
            if !subscription.wants(topic) {
                return true;
            }
            match subscription
                .sender
                .try_send(BusMessage::new(topic, payload.clone()))
            {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(topic, "removing disconnected bus subscriber");
                    false
                }
            }
        });

        if dropped > 0 {
            warn!(topic, dropped, "bus subscriber queue full; message dropped");
            return Err(BusError::Rejected(format!(
                "{dropped} subscriber queue(s) full for {topic}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_by_filter() {
        let bus = LocalBus::new();
        let sensors = bus.subscribe(&["local/sensors/+"]);
        let chat = bus.subscribe(&["local/chat/responses", "local/analysis/results"]);

        bus.publish("local/sensors/t1", b"{}".to_vec()).unwrap();
        bus.publish("local/chat/responses", b"{}".to_vec()).unwrap();
        bus.publish("local/other", b"{}".to_vec()).unwrap();

        assert_eq!(sensors.try_recv().unwrap().topic, "local/sensors/t1");
        assert!(sensors.try_recv().is_err());
        assert_eq!(chat.try_recv().unwrap().topic, "local/chat/responses");
        assert!(chat.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_does_not_block() {
        let bus = LocalBus::with_queue_depth(1);
        let receiver = bus.subscribe(&["#"]);
        bus.publish("a", b"1".to_vec()).unwrap();
        assert!(bus.publish("a", b"2".to_vec()).is_err());
        assert_eq!(receiver.len(), 1);
        assert_eq!(bus.pending(), 1);
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let bus = LocalBus::new();
        let receiver = bus.subscribe(&["#"]);
        drop(receiver);
        bus.publish("a", b"1".to_vec()).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
