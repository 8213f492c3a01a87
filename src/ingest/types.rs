//! Canonical sensor reading and the reasons a payload can be rejected.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A validated sensor reading. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    /// Sensor category (`type` on the wire)
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// Anomaly flag set by the producer. Informational only.
    #[serde(default)]
    pub is_anomaly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_id: Option<String>,
}

impl Reading {
    /// Build a reading directly, bypassing payload validation.
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type: sensor_type.into(),
            value,
            unit: unit.into(),
            timestamp,
            is_anomaly: false,
            location: None,
            equipment_id: None,
        }
    }

    pub fn flagged(mut self, is_anomaly: bool) -> Self {
        self.is_anomaly = is_anomaly;
        self
    }

    /// Parse and validate a raw bus payload.
    ///
    /// `sensor_id`, `type`, `value` and `timestamp` are required. The timestamp
    /// may be an RFC 3339 string or integer epoch milliseconds.
    pub fn from_payload(payload: &[u8]) -> Result<Self, RejectReason> {
        let text = std::str::from_utf8(payload).map_err(|_| RejectReason::NotUtf8)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| RejectReason::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(RejectReason::NotAnObject)?;

        let sensor_id = required_str(object, "sensor_id")?;
        let sensor_type = required_str(object, "type")?;
        let reading_value = match object.get("value") {
            None | Some(Value::Null) => return Err(RejectReason::MissingField("value")),
            Some(v) => v
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or(RejectReason::InvalidField("value"))?,
        };
        let timestamp = match object.get("timestamp") {
            None | Some(Value::Null) => return Err(RejectReason::MissingField("timestamp")),
            Some(v) => parse_timestamp(v).ok_or(RejectReason::InvalidField("timestamp"))?,
        };

        let unit = optional_str(object, "unit")?.unwrap_or_default();
        let is_anomaly = match object.get("is_anomaly") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(RejectReason::InvalidField("is_anomaly")),
        };

        Ok(Self {
            sensor_id,
            sensor_type,
            value: reading_value,
            unit,
            timestamp,
            is_anomaly,
            location: optional_str(object, "location")?,
            equipment_id: optional_str(object, "equipment_id")?,
        })
    }
}

fn required_str(object: &Map<String, Value>, field: &'static str) -> Result<String, RejectReason> {
    match object.get(field) {
        None | Some(Value::Null) => Err(RejectReason::MissingField(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(RejectReason::InvalidField(field)),
    }
}

fn optional_str(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, RejectReason> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RejectReason::InvalidField(field)),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // Naive ISO-8601 without an offset is taken as UTC
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Why a payload was not accepted as a reading.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    NotUtf8,
    InvalidJson(String),
    NotAnObject,
    MissingField(&'static str),
    InvalidField(&'static str),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotUtf8 => write!(f, "payload is not UTF-8"),
            RejectReason::InvalidJson(e) => write!(f, "invalid JSON: {e}"),
            RejectReason::NotAnObject => write!(f, "payload is not a JSON object"),
            RejectReason::MissingField(field) => write!(f, "missing field '{field}'"),
            RejectReason::InvalidField(field) => write!(f, "invalid field '{field}'"),
        }
    }
}

impl std::error::Error for RejectReason {}
