//! Listener registry.

use crate::stats::SharedPipelineStats;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// A sink for broadcast messages. Delivery must not block.
pub trait Listener: Send + Sync {
    fn deliver(&self, message: &str) -> Result<(), DeliveryError>;
}

/// Listener backed by a tokio channel, e.g. one per WebSocket connection.
pub struct ChannelListener {
    sender: UnboundedSender<String>,
}

impl ChannelListener {
    pub fn new(sender: UnboundedSender<String>) -> Self {
        Self { sender }
    }
}

impl Listener for ChannelListener {
    fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        self.sender
            .send(message.to_string())
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Registration handle returned by `BroadcastRegistry::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The set of currently connected listeners.
pub struct BroadcastRegistry {
    listeners: RwLock<BTreeMap<ListenerHandle, Arc<dyn Listener>>>,
    next_id: AtomicU64,
    stats: Option<SharedPipelineStats>,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: SharedPipelineStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn register(&self, listener: Arc<dyn Listener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handle, listener);
        debug!(listener = handle.0, "listener registered");
        handle
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        let removed = self
            .listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&handle)
            .is_some();
        if removed {
            debug!(listener = handle.0, "listener unregistered");
        }
        removed
    }

    /// Deliver `message` to every listener registered when the call starts.
    ///
    /// Delivery happens outside the lock on a copy of the membership. Listeners
    /// that fail are removed afterwards. Returns the number of successful
    /// deliveries.
    pub fn publish(&self, message: &str) -> usize {
        let listeners: Vec<(ListenerHandle, Arc<dyn Listener>)> = self
            .listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(handle, listener)| (*handle, Arc::clone(listener)))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (handle, listener) in listeners {
            match listener.deliver(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(listener = handle.0, "delivery failed: {e}");
                    failed.push(handle);
                }
            }
        }

        if !failed.is_empty() {
            let mut live = self.listeners.write().unwrap_or_else(|p| p.into_inner());
            for handle in &failed {
                live.remove(handle);
            }
            debug!(pruned = failed.len(), "removed failed listeners");
        }

        if let Some(ref stats) = self.stats {
            stats.record_broadcast();
            if !failed.is_empty() {
                stats.record_listeners_pruned(failed.len() as u64);
            }
        }

        delivered
    }

    /// Serialize `value` and publish it.
    pub fn publish_json<T: serde::Serialize>(&self, value: &T) -> usize {
        match serde_json::to_string(value) {
            Ok(message) => self.publish(&message),
            Err(e) => {
                tracing::warn!("could not encode broadcast message: {e}");
                0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: ListenerHandle) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&handle)
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared registry.
pub type SharedBroadcastRegistry = Arc<BroadcastRegistry>;

/// Listener delivery errors.
#[derive(Debug)]
pub enum DeliveryError {
    /// The receiving side has gone away
    Closed,
    /// The sink refused the message
    Failed(String),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "Listener closed"),
            DeliveryError::Failed(msg) => write!(f, "Delivery failed: {msg}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::create_shared_stats;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        received: Mutex<Vec<String>>,
    }

    impl Listener for Recording {
        fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
            self.received.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    struct Broken;

    impl Listener for Broken {
        fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed("socket reset".to_string()))
        }
    }

    /// Unregisters itself mid-broadcast.
    struct Leaving {
        registry: Arc<BroadcastRegistry>,
        handle: Mutex<Option<ListenerHandle>>,
    }

    impl Listener for Leaving {
        fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                self.registry.unregister(handle);
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_listener_is_isolated_and_removed() {
        let stats = create_shared_stats();
        let registry = BroadcastRegistry::new().with_stats(stats.clone());
        let first = Arc::new(Recording::default());
        let third = Arc::new(Recording::default());

        registry.register(first.clone());
        let broken = registry.register(Arc::new(Broken));
        registry.register(third.clone());

        assert_eq!(registry.publish("hello"), 2);
        assert_eq!(*first.received.lock().unwrap(), vec!["hello"]);
        assert_eq!(*third.received.lock().unwrap(), vec!["hello"]);
        assert!(!registry.contains(broken));
        assert_eq!(registry.len(), 2);
        assert_eq!(stats.snapshot().listeners_pruned, 1);
        assert_eq!(stats.snapshot().broadcasts, 1);
    }

    #[test]
    fn test_unregister_during_publish() {
        let registry = Arc::new(BroadcastRegistry::new());
        let leaving = Arc::new(Leaving {
            registry: registry.clone(),
            handle: Mutex::new(None),
        });
        let handle = registry.register(leaving.clone());
        *leaving.handle.lock().unwrap() = Some(handle);
        let other = Arc::new(Recording::default());
        registry.register(other.clone());

        assert_eq!(registry.publish("a"), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(other.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_channel_listener_closed() {
        let registry = BroadcastRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let open = registry.register(Arc::new(ChannelListener::new(tx)));
        let (closed_tx, closed_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        drop(closed_rx);
        registry.register(Arc::new(ChannelListener::new(closed_tx)));

        assert_eq!(registry.publish("ping"), 1);
        assert_eq!(rx.try_recv().unwrap(), "ping");
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(open));
        assert!(!registry.unregister(open));
        assert!(registry.is_empty());
    }
}
