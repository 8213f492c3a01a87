//! Core functionality for the edge sensor copilot.
//!
//! This module contains:
//! - Windowed aggregation of readings per sensor type
//! - Severity classification against configured thresholds
//! - Bounded anomaly and analysis logs
//! - Context snapshot building for reasoning queries

pub mod anomaly;
pub mod classifier;
pub mod context;
pub mod windowing;

// Re-export commonly used types
pub use anomaly::{AnalysisLog, AnomalyLog, AnomalyRecord};
pub use classifier::{classify, Classifier, EscalationBands, SeverityTier, Thresholds};
pub use context::{ContextBuilder, ContextSnapshot, WindowContext};
pub use windowing::{round2, ReadingWindow, Summary, WindowAggregator};
