//! Message bus boundary.
//!
//! The pipeline never talks to a broker directly. Components that publish hold
//! their own `BusPublisher` handle, and inbound traffic arrives as
//! `BusMessage` values fed to the dispatcher by whichever adapter is in use.
//! Delivery is assumed at-least-once and unordered; publishing is best effort.

pub mod lines;
pub mod local;

pub use lines::{parse_line, pump_lines};
pub use local::LocalBus;

use serde::Serialize;

/// One message on a named topic. Payloads are UTF-8 JSON by convention.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serialize `value` as the JSON payload.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, BusError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))?;
        Ok(Self::new(topic, payload))
    }
}

/// Publish side of the bus.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Serialize and publish a JSON value.
pub fn publish_json<T: Serialize>(
    bus: &dyn BusPublisher,
    topic: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))?;
    bus.publish(topic, payload)
}

/// Check a topic against an MQTT-style filter.
///
/// `+` matches exactly one level and `#` (last level only) matches any
/// remainder, including nothing.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Bus errors.
#[derive(Debug)]
pub enum BusError {
    /// Payload could not be encoded
    Serialization(String),
    /// Line could not be decoded into a message
    Malformed(String),
    /// The transport refused the message (e.g. queue full)
    Rejected(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Serialization(msg) => write!(f, "Bus serialization error: {msg}"),
            BusError::Malformed(msg) => write!(f, "Malformed bus message: {msg}"),
            BusError::Rejected(msg) => write!(f, "Bus rejected message: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}
