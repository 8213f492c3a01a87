//! Pipeline statistics.
//!
//! Counters describing what the pipeline accepted, dropped and delivered.
//! They live in memory only and reset on restart.

pub mod counters;

// Re-export commonly used types
pub use counters::{create_shared_stats, PipelineStats, SharedPipelineStats, StatsSnapshot};
