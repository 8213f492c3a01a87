//! Severity classification against per-sensor-type thresholds.
//!
//! A reading is classified from its value alone. The `is_anomaly` flag set by
//! the producer is never consulted: a value inside the normal range is always
//! `Normal`, and a value outside it is tiered by how far it strays.

use crate::core::windowing::Summary;
use crate::stats::SharedPipelineStats;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::warn;

/// Severity tier of a reading or window summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityTier {
    Normal,
    Warning,
    Critical,
}

impl SeverityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityTier::Normal => "normal",
            SeverityTier::Warning => "warning",
            SeverityTier::Critical => "critical",
        }
    }

    /// Whether this tier counts as an anomaly.
    pub fn is_anomalous(&self) -> bool {
        *self != SeverityTier::Normal
    }
}

impl std::fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deviation ratios above which a reading escalates.
///
/// A ratio strictly greater than `critical` is critical; strictly greater
/// than `warning` (and not critical) is a warning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EscalationBands {
    pub warning: f64,
    pub critical: f64,
}

impl Default for EscalationBands {
    fn default() -> Self {
        Self {
            warning: 0.2,
            critical: 0.5,
        }
    }
}

/// Normal operating range for one sensor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub unit: String,
    /// Extra words operators use for this sensor type in questions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Overrides the global escalation bands for this type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationBands>,
}

impl Thresholds {
    pub fn new(min: f64, max: f64, unit: &str) -> Self {
        Self {
            min,
            max,
            unit: unit.to_string(),
            aliases: Vec::new(),
            escalation: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    /// A range that nothing falls outside of.
    pub fn permissive() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY, "")
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// How far `value` lies outside the normal range, relative to the bound it crossed.
///
/// Returns 0.0 for values inside the range. Bounds are compared by magnitude so
/// negative ranges behave; a zero bound is measured against the range width,
/// and an excursion from a zero-width range at zero is infinite.
pub fn deviation_ratio(value: f64, thresholds: &Thresholds) -> f64 {
    if value > thresholds.max {
        relative_excess(value - thresholds.max, thresholds.max, thresholds)
    } else if value < thresholds.min {
        relative_excess(thresholds.min - value, thresholds.min, thresholds)
    } else {
        0.0
    }
}

fn relative_excess(excess: f64, bound: f64, thresholds: &Thresholds) -> f64 {
    let denominator = if bound != 0.0 {
        bound.abs()
    } else {
        thresholds.max - thresholds.min
    };

    if denominator > 0.0 && denominator.is_finite() {
        excess / denominator
    } else {
        f64::INFINITY
    }
}

/// Classify a single value against a normal range.
pub fn classify(value: f64, thresholds: &Thresholds, bands: &EscalationBands) -> SeverityTier {
    let bands = thresholds.escalation.as_ref().unwrap_or(bands);
    let deviation = deviation_ratio(value, thresholds);

    if deviation > bands.critical {
        SeverityTier::Critical
    } else if deviation > bands.warning {
        SeverityTier::Warning
    } else {
        SeverityTier::Normal
    }
}

/// Classifier holding the configured thresholds for every known sensor type.
pub struct Classifier {
    sensors: BTreeMap<String, Thresholds>,
    bands: EscalationBands,
    permissive: Thresholds,
    reported_gaps: Mutex<HashSet<String>>,
    stats: Option<SharedPipelineStats>,
}

impl Classifier {
    pub fn new(sensors: BTreeMap<String, Thresholds>, bands: EscalationBands) -> Self {
        Self {
            sensors,
            bands,
            permissive: Thresholds::permissive(),
            reported_gaps: Mutex::new(HashSet::new()),
            stats: None,
        }
    }

    /// Count configuration gaps in the shared pipeline statistics.
    pub fn with_stats(mut self, stats: SharedPipelineStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.sensors.clone(), config.escalation)
    }

    /// Configured thresholds for a sensor type, if any.
    pub fn thresholds(&self, sensor_type: &str) -> Option<&Thresholds> {
        self.sensors.get(sensor_type)
    }

    /// All configured sensor types, in name order.
    pub fn sensor_types(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(|s| s.as_str())
    }

    pub fn bands(&self) -> &EscalationBands {
        &self.bands
    }

    /// Classify a value for a sensor type.
    ///
    /// Unconfigured types fall back to a permissive range and are reported
    /// once per type as a configuration gap.
    pub fn classify(&self, sensor_type: &str, value: f64) -> SeverityTier {
        let thresholds = self.resolve(sensor_type);
        classify(value, thresholds, &self.bands)
    }

    /// Classify a window summary as the worse of its extremes.
    pub fn classify_summary(&self, sensor_type: &str, summary: &Summary) -> SeverityTier {
        if summary.is_empty() {
            return SeverityTier::Normal;
        }
        let thresholds = self.resolve(sensor_type);
        classify(summary.min, thresholds, &self.bands)
            .max(classify(summary.max, thresholds, &self.bands))
    }

    /// Sensor types seen without configured thresholds.
    pub fn config_gaps(&self) -> Vec<String> {
        let gaps = self
            .reported_gaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut gaps: Vec<String> = gaps.iter().cloned().collect();
        gaps.sort();
        gaps
    }

    fn resolve(&self, sensor_type: &str) -> &Thresholds {
        match self.sensors.get(sensor_type) {
            Some(thresholds) => thresholds,
            None => {
                self.report_gap(sensor_type);
                &self.permissive
            }
        }
    }

    fn report_gap(&self, sensor_type: &str) {
        let mut gaps = self
            .reported_gaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if gaps.insert(sensor_type.to_string()) {
            warn!(
                sensor_type,
                "no thresholds configured; classifying permissively (configuration gap)"
            );
            if let Some(ref stats) = self.stats {
                stats.record_config_gap();
            }
        }
    }
}
