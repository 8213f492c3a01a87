//! Chat exchange records and wire messages.

use crate::core::context::ContextSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of the asynchronous answer to one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    Pending,
    Resolved,
    TimedOut,
}

/// Correlation record linking a question to its eventual answer.
#[derive(Debug, Clone)]
pub struct ChatExchange {
    pub id: Uuid,
    pub question: String,
    pub snapshot: Arc<ContextSnapshot>,
    pub state: ExchangeState,
    /// Answer returned synchronously to the asker
    pub fallback_answer: String,
    /// Answer from the reasoning service, once resolved
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ChatExchange {
    pub fn new(
        question: &str,
        snapshot: Arc<ContextSnapshot>,
        fallback_answer: String,
        created_at: DateTime<Utc>,
        deadline: Duration,
    ) -> Self {
        let deadline =
            chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            snapshot,
            state: ExchangeState::Pending,
            fallback_answer,
            answer: None,
            created_at,
            deadline_at: created_at
                .checked_add_signed(deadline)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == ExchangeState::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.deadline_at
    }

    /// Move to `Resolved`. Only pending exchanges change state.
    pub fn resolve(&mut self, answer: &str, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = ExchangeState::Resolved;
        self.answer = Some(answer.to_string());
        self.resolved_at = Some(now);
        true
    }

    /// Move to `TimedOut`. Only pending exchanges change state.
    pub fn time_out(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = ExchangeState::TimedOut;
        true
    }
}

/// Answer delivered to the asker and to broadcast listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl ChatReply {
    pub fn response(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: "response".to_string(),
            message: message.into(),
            timestamp,
            request_id: None,
        }
    }

    pub fn for_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Reasoning request published on the chat request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatQuery {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: Uuid,
    pub message: String,
    pub enhanced_prompt: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Answer arriving on the chat response topic.
///
/// Answers may omit `request_id`; they are then matched on `original_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAnswer {
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub original_message: Option<String>,
    #[serde(alias = "message")]
    pub response: String,
}

/// Who said a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub speaker: Speaker,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Chat errors.
#[derive(Debug)]
pub enum ChatError {
    /// The question was empty or whitespace
    EmptyMessage,
    /// An answer payload could not be decoded
    MalformedAnswer(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::EmptyMessage => write!(f, "Message cannot be empty"),
            ChatError::MalformedAnswer(msg) => write!(f, "Malformed chat answer: {msg}"),
        }
    }
}

impl std::error::Error for ChatError {}
