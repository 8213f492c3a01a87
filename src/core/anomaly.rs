//! Bounded logs of classified anomalies and of analysis results.

use crate::core::classifier::SeverityTier;
use crate::ingest::Reading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Remembered anomaly keys per retained record, for redelivery detection.
const DEDUP_FACTOR: usize = 8;

/// A reading that classified above normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub sensor_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub severity: SeverityTier,
    pub timestamp: DateTime<Utc>,
    /// What the producer claimed; kept for comparison only
    pub producer_flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equipment_id: Option<String>,
}

impl AnomalyRecord {
    pub fn from_reading(reading: &Reading, severity: SeverityTier) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            sensor_type: reading.sensor_type.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
            severity,
            timestamp: reading.timestamp,
            producer_flagged: reading.is_anomaly,
            location: reading.location.clone(),
            equipment_id: reading.equipment_id.clone(),
        }
    }

    fn key(&self) -> (String, DateTime<Utc>) {
        (self.sensor_id.clone(), self.timestamp)
    }
}

struct AnomalyLogState {
    records: VecDeque<AnomalyRecord>,
    seen: HashSet<(String, DateTime<Utc>)>,
    seen_order: VecDeque<(String, DateTime<Utc>)>,
    total: u64,
}

/// Most recent anomalies, de-duplicated by (sensor_id, timestamp).
///
/// The bus delivers at least once, so the same anomaly can arrive twice;
/// `record` accepts it only the first time.
pub struct AnomalyLog {
    capacity: usize,
    state: Mutex<AnomalyLogState>,
}

impl AnomalyLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(AnomalyLogState {
                records: VecDeque::new(),
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
                total: 0,
            }),
        }
    }

    /// Record an anomaly. Returns `false` if it was already recorded.
    pub fn record(&self, record: AnomalyRecord) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let key = record.key();
        if !state.seen.insert(key.clone()) {
            return false;
        }

        state.seen_order.push_back(key);
        while state.seen_order.len() > self.capacity * DEDUP_FACTOR {
            if let Some(old) = state.seen_order.pop_front() {
                state.seen.remove(&old);
            }
        }

        state.records.push_back(record);
        while state.records.len() > self.capacity {
            state.records.pop_front();
        }
        state.total += 1;
        true
    }

    /// Up to `limit` anomalies, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AnomalyRecord> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.records.iter().rev().take(limit).cloned().collect()
    }

    /// Distinct anomalies recorded since startup.
    pub fn total(&self) -> u64 {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).total
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Analysis results received from the analysis topic, oldest first.
pub struct AnalysisLog {
    capacity: usize,
    entries: Mutex<VecDeque<serde_json::Value>>,
}

impl AnalysisLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: serde_json::Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The last `limit` entries in arrival order.
    pub fn latest(&self, limit: usize) -> Vec<serde_json::Value> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(sensor_id: &str, second: u32) -> AnomalyRecord {
        let reading = Reading::new(
            sensor_id,
            "pressure",
            450.0,
            "kPa",
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, second).unwrap(),
        )
        .flagged(true);
        AnomalyRecord::from_reading(&reading, SeverityTier::Critical)
    }

    #[test]
    fn test_duplicate_anomaly_recorded_once() {
        let log = AnomalyLog::new(10);
        assert!(log.record(record("p1", 0)));
        assert!(!log.record(record("p1", 0)));
        assert!(log.record(record("p2", 0)));
        assert_eq!(log.total(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_recent_is_bounded_and_newest_first() {
        let log = AnomalyLog::new(3);
        for second in 0..5 {
            log.record(record("p1", second));
        }
        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp.timestamp() % 60, 4);
        assert_eq!(recent[2].timestamp.timestamp() % 60, 2);
        assert_eq!(log.recent(1).len(), 1);
        assert_eq!(log.total(), 5);
    }

    #[test]
    fn test_analysis_log_keeps_latest() {
        let log = AnalysisLog::new(3);
        for i in 0..5 {
            log.push(json!({ "seq": i }));
        }
        assert_eq!(log.len(), 3);
        let latest = log.latest(2);
        assert_eq!(latest, vec![json!({ "seq": 3 }), json!({ "seq": 4 })]);
    }
}
