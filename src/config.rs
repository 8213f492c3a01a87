//! Configuration for the edge sensor copilot.

use crate::core::classifier::{EscalationBands, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trailing windows kept per sensor type. The first entry is the primary window.
    #[serde(with = "duration_list_serde")]
    pub window_durations: Vec<Duration>,

    /// Maximum readings retained per (sensor type, window) buffer
    pub buffer_capacity: usize,

    /// Normal ranges keyed by sensor type
    pub sensors: BTreeMap<String, Thresholds>,

    /// Deviation ratios that escalate to warning / critical
    pub escalation: EscalationBands,

    /// How long a chat exchange waits for the asynchronous answer
    #[serde(with = "duration_serde")]
    pub chat_deadline: Duration,

    /// Number of chat entries kept in history
    pub chat_history_limit: usize,

    /// Number of classified anomalies carried in a context snapshot
    pub recent_anomaly_limit: usize,

    /// Number of analysis results retained from the analysis topic
    pub analysis_history_limit: usize,

    /// Bus topic names
    pub topics: TopicConfig,

    /// Port for the chat web server
    pub web_port: u16,

    /// Identifier stamped on published analysis results
    pub node_id: String,
}

impl Default for Config {
    fn default() -> Self {
        let node_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "edge-node".to_string());

        Self {
            window_durations: vec![Duration::from_secs(30 * 60), Duration::from_secs(60 * 60)],
            buffer_capacity: 1000,
            sensors: default_sensors(),
            escalation: EscalationBands::default(),
            chat_deadline: Duration::from_secs(30),
            chat_history_limit: 50,
            recent_anomaly_limit: 10,
            analysis_history_limit: 100,
            topics: TopicConfig::default(),
            web_port: 8080,
            node_id,
        }
    }
}

fn default_sensors() -> BTreeMap<String, Thresholds> {
    let mut sensors = BTreeMap::new();
    sensors.insert(
        "temperature".to_string(),
        Thresholds::new(20.0, 80.0, "celsius").with_aliases(&["temp", "hot", "cold"]),
    );
    sensors.insert("pressure".to_string(), Thresholds::new(100.0, 200.0, "kPa"));
    sensors.insert(
        "vibration".to_string(),
        Thresholds::new(0.0, 10.0, "mm/s").with_aliases(&["vibrate"]),
    );
    sensors
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("edge-sensor-copilot")
            .join("config.json")
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_durations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one window duration is required".to_string(),
            ));
        }
        if self.window_durations.iter().any(|d| d.is_zero()) {
            return Err(ConfigError::Invalid(
                "window durations must be non-zero".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        for (sensor_type, thresholds) in &self.sensors {
            if thresholds.min > thresholds.max {
                return Err(ConfigError::Invalid(format!(
                    "sensor '{sensor_type}' has min {} above max {}",
                    thresholds.min, thresholds.max
                )));
            }
        }
        if self.escalation.warning >= self.escalation.critical {
            return Err(ConfigError::Invalid(format!(
                "warning ratio {} must be below critical ratio {}",
                self.escalation.warning, self.escalation.critical
            )));
        }
        Ok(())
    }

    /// The window used for status answers and anomaly totals.
    pub fn primary_window(&self) -> Duration {
        self.window_durations
            .first()
            .copied()
            .unwrap_or(Duration::from_secs(30 * 60))
    }

    /// The longest configured window.
    pub fn longest_window(&self) -> Duration {
        self.window_durations
            .iter()
            .copied()
            .max()
            .unwrap_or_else(|| self.primary_window())
    }
}

/// Topic names used on the message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Wildcard filter for sensor readings
    pub sensor_readings: String,
    /// Anomaly analysis results (consumed and produced)
    pub analysis_results: String,
    /// Chat requests sent to the reasoning service
    pub chat_requests: String,
    /// Chat answers coming back from the reasoning service
    pub chat_responses: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sensor_readings: "local/sensors/+".to_string(),
            analysis_results: "local/analysis/results".to_string(),
            chat_requests: "local/chat/requests".to_string(),
            chat_responses: "local/chat/responses".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for a list of durations, in seconds.
mod duration_list_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs: Vec<u64> = durations.iter().map(|d| d.as_secs()).collect();
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Vec::<u64>::deserialize(deserializer)?;
        Ok(secs.into_iter().map(Duration::from_secs).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.window_durations.len(), 2);
        assert_eq!(config.primary_window(), Duration::from_secs(1800));
        assert_eq!(config.longest_window(), Duration::from_secs(3600));
        assert_eq!(config.buffer_capacity, 1000);
        assert!(config.sensors.contains_key("temperature"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "window_durations": [60, 300], "chat_deadline": 5 }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.window_durations,
            vec![Duration::from_secs(60), Duration::from_secs(300)]
        );
        assert_eq!(config.chat_deadline, Duration::from_secs(5));
        assert_eq!(config.topics.sensor_readings, "local/sensors/+");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.window_durations.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .sensors
            .insert("bad".to_string(), Thresholds::new(10.0, 5.0, ""));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.escalation = EscalationBands {
            warning: 0.6,
            critical: 0.5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.window_durations, config.window_durations);
        assert_eq!(parsed.sensors.len(), config.sensors.len());
    }
}
