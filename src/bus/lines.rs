//! JSON-lines bus adapter.
//!
//! Each line is `{"topic": "...", "payload": <json>}`. This lets a recorded
//! feed or another process's stdout stand in for a broker.

use crate::bus::{BusError, BusMessage, BusPublisher};
use serde::Deserialize;
use std::io::BufRead;
use tracing::warn;

#[derive(Deserialize)]
struct Line {
    topic: String,
    payload: serde_json::Value,
}

/// Decode one line into a bus message.
pub fn parse_line(line: &str) -> Result<BusMessage, BusError> {
    let line: Line = serde_json::from_str(line).map_err(|e| BusError::Malformed(e.to_string()))?;
    let payload = match line.payload {
        // A string payload is forwarded verbatim so malformed JSON can be replayed
        serde_json::Value::String(raw) => raw.into_bytes(),
        other => serde_json::to_vec(&other).map_err(|e| BusError::Serialization(e.to_string()))?,
    };
    Ok(BusMessage::new(line.topic, payload))
}

/// Publish every decodable line of `reader` onto `bus`. Returns the number published.
pub fn pump_lines<R: BufRead>(reader: R, bus: &dyn BusPublisher) -> usize {
    let mut published = 0;
    for (number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("stopped reading bus feed at line {}: {e}", number + 1);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(message) => match bus.publish(&message.topic, message.payload) {
                Ok(()) => published += 1,
                Err(e) => warn!("line {}: {e}", number + 1),
            },
            Err(e) => warn!("skipping line {}: {e}", number + 1),
        }
    }
    published
}
