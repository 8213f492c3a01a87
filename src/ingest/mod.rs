//! Sensor reading ingestion.
//!
//! Raw bus payloads are validated into canonical `Reading` values, classified,
//! and forwarded to the windowed aggregator.

pub mod ingestor;
pub mod types;

// Re-export commonly used types
pub use ingestor::{describe_anomaly, AnalysisResult, Ingestor};
pub use types::{Reading, RejectReason};
