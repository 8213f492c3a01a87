//! Fan-out of chat answers to connected listeners.
//!
//! Listeners register for their connected lifetime. A listener that fails a
//! single delivery is dropped from the registry; it never stops the others
//! from receiving the message.

pub mod registry;

// Re-export commonly used types
pub use registry::{
    BroadcastRegistry, ChannelListener, DeliveryError, Listener, ListenerHandle,
    SharedBroadcastRegistry,
};
