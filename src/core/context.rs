//! Context snapshots handed to reasoning queries.
//!
//! A snapshot is a value: built on demand from the aggregator, the anomaly log
//! and the analysis log, and never mutated afterwards.

use crate::core::anomaly::{AnalysisLog, AnomalyLog, AnomalyRecord};
use crate::core::classifier::SeverityTier;
use crate::core::windowing::{Summary, WindowAggregator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Analysis results carried in each snapshot.
pub const RECENT_ANALYSIS_LIMIT: usize = 5;

/// Summaries for every known sensor type over one trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowContext {
    pub window_secs: u64,
    pub summaries: BTreeMap<String, Summary>,
    pub severities: BTreeMap<String, SeverityTier>,
    pub total_readings: usize,
    pub total_anomalies: usize,
}

impl WindowContext {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Whether any sensor type has readings in this window.
    pub fn has_data(&self) -> bool {
        self.total_readings > 0
    }

    /// Human label such as "last 30 minutes".
    pub fn label(&self) -> String {
        describe_window(self.duration())
    }
}

/// Immutable aggregate of current summaries and recent anomalies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// One entry per requested window, in request order. The first is primary.
    pub windows: Vec<WindowContext>,
    /// Anomalies in the primary window
    pub total_anomaly_count: usize,
    pub generated_at: DateTime<Utc>,
    /// Most recent classified anomalies, newest first
    pub recent_anomalies: Vec<AnomalyRecord>,
    /// Latest analysis results, oldest first
    pub recent_analyses: Vec<serde_json::Value>,
}

// `generated_at` is a stamp, not content.
impl PartialEq for ContextSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.windows == other.windows
            && self.total_anomaly_count == other.total_anomaly_count
            && self.recent_anomalies == other.recent_anomalies
            && self.recent_analyses == other.recent_analyses
    }
}

impl ContextSnapshot {
    pub fn primary(&self) -> Option<&WindowContext> {
        self.windows.first()
    }

    /// Whether the primary window holds any readings.
    pub fn has_data(&self) -> bool {
        self.primary().map(|w| w.has_data()).unwrap_or(false)
    }

    /// Summary of a sensor type in the primary window.
    pub fn summary(&self, sensor_type: &str) -> Option<&Summary> {
        self.primary().and_then(|w| w.summaries.get(sensor_type))
    }

    /// Severity of a sensor type's primary-window summary.
    pub fn severity(&self, sensor_type: &str) -> SeverityTier {
        self.primary()
            .and_then(|w| w.severities.get(sensor_type))
            .copied()
            .unwrap_or(SeverityTier::Normal)
    }

    pub fn window(&self, duration: Duration) -> Option<&WindowContext> {
        self.windows.iter().find(|w| w.duration() == duration)
    }
}

/// Format a window duration for people.
pub fn describe_window(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (amount, unit) = if secs % 3600 == 0 && secs >= 3600 {
        (secs / 3600, "hour")
    } else if secs % 60 == 0 && secs >= 60 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };

    if amount == 1 {
        format!("last {unit}")
    } else {
        format!("last {amount} {unit}s")
    }
}

/// Assembles snapshots from the live pipeline state. Performs no I/O.
pub struct ContextBuilder {
    aggregator: Arc<WindowAggregator>,
    anomalies: Arc<AnomalyLog>,
    analyses: Arc<AnalysisLog>,
    default_windows: Vec<Duration>,
    recent_anomaly_limit: usize,
}

impl ContextBuilder {
    pub fn new(
        aggregator: Arc<WindowAggregator>,
        anomalies: Arc<AnomalyLog>,
        analyses: Arc<AnalysisLog>,
        default_windows: Vec<Duration>,
        recent_anomaly_limit: usize,
    ) -> Self {
        Self {
            aggregator,
            anomalies,
            analyses,
            default_windows,
            recent_anomaly_limit,
        }
    }

    pub fn aggregator(&self) -> &Arc<WindowAggregator> {
        &self.aggregator
    }

    /// Windows used when the caller does not name any.
    pub fn default_windows(&self) -> &[Duration] {
        &self.default_windows
    }

    pub fn build(&self, windows: &[Duration]) -> ContextSnapshot {
        self.build_at(windows, Utc::now())
    }

    /// Build over the configured default windows.
    pub fn build_default(&self) -> ContextSnapshot {
        self.build(&self.default_windows)
    }

    /// Build a snapshot as of `now`.
    pub fn build_at(&self, windows: &[Duration], now: DateTime<Utc>) -> ContextSnapshot {
        let sensor_types = self.aggregator.known_types();
        let classifier = self.aggregator.classifier();

        let windows: Vec<WindowContext> = windows
            .iter()
            .map(|duration| {
                let mut summaries = BTreeMap::new();
                let mut severities = BTreeMap::new();
                let mut total_readings = 0;
                let mut total_anomalies = 0;

                for sensor_type in &sensor_types {
                    let summary = self.aggregator.summarize_at(sensor_type, *duration, now);
                    total_readings += summary.count;
                    total_anomalies += summary.anomaly_count;
                    severities.insert(
                        sensor_type.clone(),
                        classifier.classify_summary(sensor_type, &summary),
                    );
                    summaries.insert(sensor_type.clone(), summary);
                }

                WindowContext {
                    window_secs: duration.as_secs(),
                    summaries,
                    severities,
                    total_readings,
                    total_anomalies,
                }
            })
            .collect();

        let total_anomaly_count = windows.first().map(|w| w.total_anomalies).unwrap_or(0);

        ContextSnapshot {
            windows,
            total_anomaly_count,
            generated_at: now,
            recent_anomalies: self.anomalies.recent(self.recent_anomaly_limit),
            recent_analyses: self.analyses.latest(RECENT_ANALYSIS_LIMIT),
        }
    }
}
