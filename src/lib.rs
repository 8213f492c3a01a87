//! Edge Sensor Copilot - windowed sensor aggregation and operator chat.
//!
//! This library ingests a stream of typed sensor readings from a message bus,
//! keeps bounded time-windowed summaries per sensor type, classifies readings
//! and summaries into severity tiers, and answers operator questions from a
//! consistent context snapshot while a remote reasoning service works on a
//! richer answer.
//!
//! # Guarantees
//!
//! - **Bounded memory**: every window buffer is limited by count and by age
//! - **Independent classification**: producer anomaly flags are never trusted
//! - **At most one analysis per anomaly**, even under bus redelivery
//! - **Isolated broadcast**: one failing listener never blocks the others
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Edge Sensor Copilot                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  bus ──▶ Dispatcher ──▶ Ingestor ──▶ WindowAggregator            │
//! │              │              │               │                    │
//! │              │              ▼               ▼                    │
//! │              │         AnomalyLog ──▶ ContextBuilder             │
//! │              │                              │                    │
//! │              └──────▶ ChatCorrelator ◀──────┘                    │
//! │                             │                                    │
//! │                             ▼                                    │
//! │                     BroadcastRegistry ──▶ listeners              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use edge_sensor_copilot::{bus::LocalBus, Config, Pipeline};
//! use std::sync::Arc;
//!
//! let bus = Arc::new(LocalBus::new());
//! let pipeline = Pipeline::new(Config::default(), bus.clone());
//! let feed = bus.subscribe(&pipeline.subscriptions());
//!
//! let dispatcher = pipeline.dispatcher();
//! while let Ok(message) = feed.recv() {
//!     dispatcher.handle(&message);
//! }
//! ```

pub mod broadcast;
pub mod bus;
pub mod chat;
pub mod config;
pub mod core;
pub mod ingest;
pub mod pipeline;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use broadcast::{BroadcastRegistry, Listener, ListenerHandle};
pub use bus::{BusError, BusMessage, BusPublisher, LocalBus};
pub use chat::{ChatCorrelator, ChatError, ChatExchange, ChatReply, ExchangeState};
pub use config::{Config, ConfigError};
pub use core::{
    classify, ContextBuilder, ContextSnapshot, SeverityTier, Summary, Thresholds,
    WindowAggregator,
};
pub use ingest::{Ingestor, Reading, RejectReason};
pub use pipeline::{Dispatch, Dispatcher, Pipeline, SensorSummary};
pub use stats::{PipelineStats, SharedPipelineStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
