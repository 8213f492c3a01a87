//! Atomic pipeline counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the running pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    /// Payloads accepted as readings
    readings_accepted: AtomicU64,
    /// Payloads rejected by the ingestor
    readings_rejected: AtomicU64,
    /// Sensor types classified without configured thresholds
    config_gaps: AtomicU64,
    /// Distinct readings classified above normal
    anomalies_detected: AtomicU64,
    /// Analysis results published to the bus
    analyses_published: AtomicU64,
    /// Chat questions answered
    chat_requests: AtomicU64,
    /// Asynchronous answers received
    async_answers: AtomicU64,
    /// Exchanges whose deadline passed without an answer
    chat_timeouts: AtomicU64,
    /// Messages fanned out to listeners
    broadcasts: AtomicU64,
    /// Listeners removed after a failed delivery
    listeners_pruned: AtomicU64,
    /// Bus publish failures
    bus_failures: AtomicU64,
    /// Start of this run
    started_at: DateTime<Utc>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            readings_accepted: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            config_gaps: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            analyses_published: AtomicU64::new(0),
            chat_requests: AtomicU64::new(0),
            async_answers: AtomicU64::new(0),
            chat_timeouts: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            listeners_pruned: AtomicU64::new(0),
            bus_failures: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_reading_accepted(&self) {
        self.readings_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reading_rejected(&self) {
        self.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_config_gap(&self) {
        self.config_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_analysis_published(&self) {
        self.analyses_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat_request(&self) {
        self.chat_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_answer(&self) {
        self.async_answers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chat_timeouts(&self, count: u64) {
        self.chat_timeouts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_listeners_pruned(&self, count: u64) {
        self.listeners_pruned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bus_failure(&self) {
        self.bus_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            readings_accepted: self.readings_accepted.load(Ordering::Relaxed),
            readings_rejected: self.readings_rejected.load(Ordering::Relaxed),
            config_gaps: self.config_gaps.load(Ordering::Relaxed),
            anomalies_detected: self.anomalies_detected.load(Ordering::Relaxed),
            analyses_published: self.analyses_published.load(Ordering::Relaxed),
            chat_requests: self.chat_requests.load(Ordering::Relaxed),
            async_answers: self.async_answers.load(Ordering::Relaxed),
            chat_timeouts: self.chat_timeouts.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            listeners_pruned: self.listeners_pruned.load(Ordering::Relaxed),
            bus_failures: self.bus_failures.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Pipeline Statistics:\n\
             - Readings accepted: {}\n\
             - Readings rejected: {}\n\
             - Configuration gaps: {}\n\
             - Anomalies detected: {}\n\
             - Analyses published: {}\n\
             - Chat requests: {}\n\
             - Asynchronous answers: {}\n\
             - Chat timeouts: {}\n\
             - Broadcasts: {}\n\
             - Listeners pruned: {}\n\
             - Bus failures: {}\n\
             - Uptime: {} seconds",
            stats.readings_accepted,
            stats.readings_rejected,
            stats.config_gaps,
            stats.anomalies_detected,
            stats.analyses_published,
            stats.chat_requests,
            stats.async_answers,
            stats.chat_timeouts,
            stats.broadcasts,
            stats.listeners_pruned,
            stats.bus_failures,
            stats.uptime_secs
        )
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub readings_accepted: u64,
    pub readings_rejected: u64,
    pub config_gaps: u64,
    pub anomalies_detected: u64,
    pub analyses_published: u64,
    pub chat_requests: u64,
    pub async_answers: u64,
    pub chat_timeouts: u64,
    pub broadcasts: u64,
    pub listeners_pruned: u64,
    pub bus_failures: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Thread-safe shared pipeline statistics.
pub type SharedPipelineStats = Arc<PipelineStats>;

/// Create a new shared statistics block.
pub fn create_shared_stats() -> SharedPipelineStats {
    Arc::new(PipelineStats::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = PipelineStats::new();

        stats.record_reading_accepted();
        stats.record_reading_accepted();
        stats.record_reading_rejected();
        stats.record_chat_timeouts(3);
        stats.record_listeners_pruned(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.readings_accepted, 2);
        assert_eq!(snapshot.readings_rejected, 1);
        assert_eq!(snapshot.chat_timeouts, 3);
        assert_eq!(snapshot.listeners_pruned, 2);
        assert_eq!(snapshot.bus_failures, 0);
    }

    #[test]
    fn test_summary_format() {
        let stats = PipelineStats::new();
        let summary = stats.summary();

        assert!(summary.contains("Readings accepted"));
        assert!(summary.contains("Readings rejected"));
        assert!(summary.contains("Listeners pruned"));
    }
}
