//! Reading ingestion.
//!
//! `Ingestor::handle` is the single entry point for sensor payloads. It never
//! fails loudly: a bad payload is counted and dropped so the bus adapter is
//! never held up by it.

use crate::bus::{publish_json, BusPublisher};
use crate::core::anomaly::{AnomalyLog, AnomalyRecord};
use crate::core::classifier::{SeverityTier, Thresholds};
use crate::core::windowing::WindowAggregator;
use crate::ingest::types::{Reading, RejectReason};
use crate::stats::SharedPipelineStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Analysis result published for each distinct anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub sensor_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub severity: SeverityTier,
    pub analysis: String,
    pub node_id: String,
    pub reading_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Validates sensor payloads and feeds them through the pipeline.
pub struct Ingestor {
    aggregator: Arc<WindowAggregator>,
    anomalies: Arc<AnomalyLog>,
    bus: Option<Arc<dyn BusPublisher>>,
    analysis_topic: String,
    node_id: String,
    stats: SharedPipelineStats,
}

impl Ingestor {
    pub fn new(
        aggregator: Arc<WindowAggregator>,
        anomalies: Arc<AnomalyLog>,
        stats: SharedPipelineStats,
    ) -> Self {
        Self {
            aggregator,
            anomalies,
            bus: None,
            analysis_topic: String::new(),
            node_id: String::new(),
            stats,
        }
    }

    /// Publish an analysis result to `topic` for every new anomaly.
    pub fn with_analysis_publisher(
        mut self,
        bus: Arc<dyn BusPublisher>,
        topic: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        self.bus = Some(bus);
        self.analysis_topic = topic.into();
        self.node_id = node_id.into();
        self
    }

    /// Validate a raw payload and, if it is a reading, ingest it.
    pub fn handle(&self, payload: &[u8]) -> Result<Reading, RejectReason> {
        self.ingest(payload).map(|(reading, _)| reading)
    }

    /// Like `handle`, also returning the reading's severity.
    pub fn ingest(&self, payload: &[u8]) -> Result<(Reading, SeverityTier), RejectReason> {
        match Reading::from_payload(payload) {
            Ok(reading) => {
                let severity = self.accept(&reading);
                Ok((reading, severity))
            }
            Err(reason) => {
                self.stats.record_reading_rejected();
                debug!("rejected sensor payload: {reason}");
                Err(reason)
            }
        }
    }

    /// Ingest an already-validated reading. Returns its severity.
    pub fn accept(&self, reading: &Reading) -> SeverityTier {
        self.stats.record_reading_accepted();
        let severity = self.aggregator.observe(reading);

        if reading.is_anomaly && !severity.is_anomalous() {
            debug!(
                sensor_id = %reading.sensor_id,
                value = reading.value,
                "producer anomaly flag not confirmed by thresholds"
            );
        }

        if severity.is_anomalous() {
            let record = AnomalyRecord::from_reading(reading, severity);
            if self.anomalies.record(record.clone()) {
                self.stats.record_anomaly();
                self.publish_analysis(&record);
            } else {
                debug!(sensor_id = %reading.sensor_id, "duplicate anomaly ignored");
            }
        }

        severity
    }

    /// Payloads rejected since startup.
    pub fn rejected_count(&self) -> u64 {
        self.stats.snapshot().readings_rejected
    }

    fn publish_analysis(&self, record: &AnomalyRecord) {
        let Some(ref bus) = self.bus else {
            return;
        };

        let thresholds = self
            .aggregator
            .classifier()
            .thresholds(&record.sensor_type);
        let result = AnalysisResult {
            kind: "anomaly_detection".to_string(),
            sensor_id: record.sensor_id.clone(),
            sensor_type: record.sensor_type.clone(),
            value: record.value,
            unit: record.unit.clone(),
            severity: record.severity,
            analysis: describe_anomaly(record, thresholds),
            node_id: self.node_id.clone(),
            reading_timestamp: record.timestamp,
            timestamp: Utc::now(),
        };

        match publish_json(bus.as_ref(), &self.analysis_topic, &result) {
            Ok(()) => self.stats.record_analysis_published(),
            Err(e) => {
                self.stats.record_bus_failure();
                warn!("failed to publish analysis for {}: {e}", record.sensor_id);
            }
        }
    }
}

/// One-line operator-facing description of an anomaly.
pub fn describe_anomaly(record: &AnomalyRecord, thresholds: Option<&Thresholds>) -> String {
    let unit = &record.unit;
    let bound = match thresholds {
        Some(t) if record.value > t.max => {
            format!(" is above the normal maximum of {} {unit}", t.max)
        }
        Some(t) if record.value < t.min => {
            format!(" is below the normal minimum of {} {unit}", t.min)
        }
        _ => " is outside the normal range".to_string(),
    };
    format!(
        "{} anomaly in {} sensor {}: value {} {unit}{bound}. Recommended action: inspect equipment and verify sensor calibration.",
        capitalize(record.severity.as_str()),
        record.sensor_type,
        record.sensor_id,
        record.value,
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
