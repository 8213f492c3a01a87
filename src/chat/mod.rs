//! Chat correlation layer.
//!
//! Questions are answered from a local, deterministic fallback built on a
//! context snapshot. The same snapshot travels to the reasoning service over
//! the bus; its answers are correlated back to the originating exchange and
//! broadcast to listeners.

pub mod correlator;
pub mod exchange;
pub mod intent;
pub mod prompt;

// Re-export commonly used types
pub use correlator::{run_deadline_sweeper, AnswerOutcome, ChatCorrelator};
pub use exchange::{
    ChatAnswer, ChatError, ChatExchange, ChatQuery, ChatReply, ExchangeState, HistoryEntry,
    Speaker,
};
pub use intent::{FallbackResponder, Intent, IntentTable};
pub use prompt::enhanced_prompt;
