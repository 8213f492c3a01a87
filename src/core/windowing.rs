//! Time-windowed aggregation of sensor readings.
//!
//! Each sensor type owns one bounded buffer per configured window duration.
//! Buffers are kept ordered by reading timestamp so expiry is a pop from the
//! front; late or duplicate timestamps are inserted in place. Memory is bounded
//! by capacity (oldest timestamp evicted first) and by time (entries older than
//! the window are dropped lazily when summarized).

use crate::core::classifier::{Classifier, SeverityTier};
use crate::ingest::Reading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Rolling statistics over one window. Stored values are full precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub anomaly_count: usize,
    pub unit: String,
}

impl Summary {
    /// The summary of a window with no recent data.
    pub fn empty(unit: &str) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            min: 0.0,
            max: 0.0,
            anomaly_count: 0,
            unit: unit.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Copy with statistics rounded to two decimals, for display.
    pub fn rounded(&self) -> Self {
        Self {
            mean: round2(self.mean),
            min: round2(self.min),
            max: round2(self.max),
            ..self.clone()
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One retained observation.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    timestamp: DateTime<Utc>,
    value: f64,
    severity: SeverityTier,
}

/// Bounded buffer of samples for one (sensor type, duration) pair.
#[derive(Debug)]
pub struct ReadingWindow {
    duration: chrono::Duration,
    capacity: usize,
    samples: VecDeque<Sample>,
    unit: String,
    evicted: u64,
}

impl ReadingWindow {
    pub fn new(duration: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            duration: to_chrono(duration),
            capacity,
            samples: VecDeque::with_capacity(capacity.min(1024)),
            unit: String::new(),
            evicted: 0,
        }
    }

    /// Number of samples currently retained (expired ones included until the next summary).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total samples dropped for capacity or age.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    fn push(&mut self, sample: Sample, unit: &str) {
        if !unit.is_empty() && self.unit != unit {
            self.unit = unit.to_string();
        }

        match self.samples.back() {
            Some(last) if sample.timestamp < last.timestamp => {
                let at = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(at, sample);
            }
            _ => self.samples.push_back(sample),
        }

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
            self.evicted += 1;
        }
    }

    /// Drop every sample with `timestamp < now - duration`. Returns how many were dropped.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            .checked_sub_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut dropped = 0;
        while matches!(self.samples.front(), Some(front) if front.timestamp < cutoff) {
            self.samples.pop_front();
            dropped += 1;
        }
        self.evicted += dropped as u64;
        dropped
    }

    /// Evict expired samples, then summarize what remains.
    pub fn summarize(&mut self, now: DateTime<Utc>) -> Summary {
        self.evict_expired(now);
        summarize_samples(self.samples.iter(), &self.unit)
    }

    /// Summarize samples newer than `cutoff` without evicting anything.
    fn summarize_since(&self, cutoff: DateTime<Utc>) -> Summary {
        summarize_samples(
            self.samples.iter().filter(|s| s.timestamp >= cutoff),
            &self.unit,
        )
    }
}

fn summarize_samples<'a>(samples: impl Iterator<Item = &'a Sample>, unit: &str) -> Summary {
    let mut values = Vec::new();
    let mut anomaly_count = 0;
    for sample in samples {
        values.push(sample.value);
        if sample.severity.is_anomalous() {
            anomaly_count += 1;
        }
    }

    if values.is_empty() {
        return Summary::empty(unit);
    }

    Summary {
        count: values.len(),
        mean: Statistics::mean(values.iter()),
        min: Statistics::min(values.iter()),
        max: Statistics::max(values.iter()),
        anomaly_count,
        unit: unit.to_string(),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 1000))
}

/// The buffers owned by one sensor type, one per window duration.
struct SensorWindows {
    windows: Vec<(Duration, Mutex<ReadingWindow>)>,
}

impl SensorWindows {
    fn new(durations: &[Duration], capacity: usize) -> Self {
        Self {
            windows: durations
                .iter()
                .map(|d| (*d, Mutex::new(ReadingWindow::new(*d, capacity))))
                .collect(),
        }
    }
}

/// Per-sensor-type windowed aggregator, safe to share across threads.
///
/// Every (sensor type, window) buffer has its own lock; the type map lock is
/// held only long enough to look up or insert a type.
pub struct WindowAggregator {
    durations: Vec<Duration>,
    capacity: usize,
    classifier: Arc<Classifier>,
    sensors: RwLock<BTreeMap<String, Arc<SensorWindows>>>,
    observed: AtomicU64,
}

impl WindowAggregator {
    pub fn new(durations: Vec<Duration>, capacity: usize, classifier: Arc<Classifier>) -> Self {
        let mut durations = durations;
        durations.sort();
        durations.dedup();
        Self {
            durations,
            capacity,
            classifier,
            sensors: RwLock::new(BTreeMap::new()),
            observed: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &crate::config::Config, classifier: Arc<Classifier>) -> Self {
        Self::new(
            config.window_durations.clone(),
            config.buffer_capacity,
            classifier,
        )
    }

    /// Configured window durations, shortest first.
    pub fn durations(&self) -> &[Duration] {
        &self.durations
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Classify a reading and append it to every window of its sensor type.
    pub fn observe(&self, reading: &Reading) -> SeverityTier {
        let severity = self.classifier.classify(&reading.sensor_type, reading.value);
        let sample = Sample {
            timestamp: reading.timestamp,
            value: reading.value,
            severity,
        };

        let windows = self.windows_for(&reading.sensor_type);
        for (_, window) in &windows.windows {
            let mut window = window.lock().unwrap_or_else(|p| p.into_inner());
            window.push(sample, &reading.unit);
        }

        self.observed.fetch_add(1, Ordering::Relaxed);
        severity
    }

    /// Summarize a sensor type over a trailing window ending now.
    pub fn summarize(&self, sensor_type: &str, window: Duration) -> Summary {
        self.summarize_at(sensor_type, window, Utc::now())
    }

    /// Summarize a sensor type over `[now - window, ..]`.
    ///
    /// A configured duration is served from its own buffer. Any other duration
    /// is filtered from the smallest configured buffer that covers it (or the
    /// largest one, if none does).
    pub fn summarize_at(&self, sensor_type: &str, window: Duration, now: DateTime<Utc>) -> Summary {
        let Some(windows) = self.existing_windows(sensor_type) else {
            return Summary::empty(&self.default_unit(sensor_type));
        };

        if let Some((_, buffer)) = windows.windows.iter().find(|(d, _)| *d == window) {
            let mut buffer = buffer.lock().unwrap_or_else(|p| p.into_inner());
            return buffer.summarize(now);
        }

        let covering = windows
            .windows
            .iter()
            .find(|(d, _)| *d >= window)
            .or_else(|| windows.windows.last());

        match covering {
            Some((_, buffer)) => {
                let mut buffer = buffer.lock().unwrap_or_else(|p| p.into_inner());
                buffer.evict_expired(now);
                let cutoff = now
                    .checked_sub_signed(to_chrono(window))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                buffer.summarize_since(cutoff)
            }
            None => Summary::empty(&self.default_unit(sensor_type)),
        }
    }

    /// Sensor types that have been observed, in name order.
    pub fn observed_types(&self) -> Vec<String> {
        let sensors = self.sensors.read().unwrap_or_else(|p| p.into_inner());
        sensors.keys().cloned().collect()
    }

    /// Observed plus configured sensor types, in name order.
    pub fn known_types(&self) -> Vec<String> {
        let mut types = self.observed_types();
        types.extend(self.classifier.sensor_types().map(|s| s.to_string()));
        types.sort();
        types.dedup();
        types
    }

    /// Readings observed since startup.
    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    /// Samples dropped across every buffer.
    pub fn evicted_count(&self) -> u64 {
        let sensors = self.sensors.read().unwrap_or_else(|p| p.into_inner());
        sensors
            .values()
            .flat_map(|s| s.windows.iter())
            .map(|(_, w)| w.lock().unwrap_or_else(|p| p.into_inner()).evicted())
            .sum()
    }

    fn default_unit(&self, sensor_type: &str) -> String {
        self.classifier
            .thresholds(sensor_type)
            .map(|t| t.unit.clone())
            .unwrap_or_default()
    }

    fn existing_windows(&self, sensor_type: &str) -> Option<Arc<SensorWindows>> {
        let sensors = self.sensors.read().unwrap_or_else(|p| p.into_inner());
        sensors.get(sensor_type).cloned()
    }

    fn windows_for(&self, sensor_type: &str) -> Arc<SensorWindows> {
        if let Some(windows) = self.existing_windows(sensor_type) {
            return windows;
        }

        let mut sensors = self.sensors.write().unwrap_or_else(|p| p.into_inner());
        sensors
            .entry(sensor_type.to_string())
            .or_insert_with(|| Arc::new(SensorWindows::new(&self.durations, self.capacity)))
            .clone()
    }
}
