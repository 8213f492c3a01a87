//! Question/answer correlation.
//!
//! Every question is answered immediately from the deterministic fallback and
//! that answer is broadcast. A reasoning request carrying the same snapshot is
//! published on the bus; its answer, whenever it arrives, is broadcast as a
//! second message and resolves the exchange if the deadline has not passed.
//! Answers that arrive after the deadline are still broadcast but leave the
//! exchange timed out.

use crate::broadcast::SharedBroadcastRegistry;
use crate::bus::{publish_json, BusPublisher};
use crate::chat::exchange::{
    ChatAnswer, ChatError, ChatExchange, ChatQuery, ChatReply, ExchangeState, HistoryEntry, Speaker,
};
use crate::chat::intent::FallbackResponder;
use crate::chat::prompt::{enhanced_prompt, status_view};
use crate::core::context::ContextBuilder;
use crate::stats::SharedPipelineStats;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exchanges retained for correlation, pending or not.
pub const RETAINED_EXCHANGES: usize = 256;

/// What happened to an inbound answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Resolved a pending exchange
    Resolved(Uuid),
    /// Matched an exchange that had already timed out
    Late(Uuid),
    /// Matched an exchange that was already resolved (redelivery)
    Duplicate(Uuid),
    /// Matched nothing we know of
    Unmatched,
}

impl AnswerOutcome {
    /// Whether the answer should reach listeners.
    pub fn broadcasts(&self) -> bool {
        !matches!(self, AnswerOutcome::Duplicate(_))
    }
}

/// Owns every `ChatExchange` and the chat history.
pub struct ChatCorrelator {
    context: Arc<ContextBuilder>,
    responder: FallbackResponder,
    broadcast: SharedBroadcastRegistry,
    bus: Option<Arc<dyn BusPublisher>>,
    request_topic: String,
    deadline: Duration,
    exchanges: Mutex<VecDeque<ChatExchange>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_limit: usize,
    stats: SharedPipelineStats,
}

impl ChatCorrelator {
    pub fn new(
        context: Arc<ContextBuilder>,
        responder: FallbackResponder,
        broadcast: SharedBroadcastRegistry,
        stats: SharedPipelineStats,
    ) -> Self {
        Self {
            context,
            responder,
            broadcast,
            bus: None,
            request_topic: String::new(),
            deadline: Duration::from_secs(30),
            exchanges: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: 50,
            stats,
        }
    }

    /// Publish reasoning requests to `topic`.
    pub fn with_bus(mut self, bus: Arc<dyn BusPublisher>, topic: impl Into<String>) -> Self {
        self.bus = Some(bus);
        self.request_topic = topic.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Answer a question and broadcast the answer to every listener.
    pub fn ask(&self, question: &str) -> Result<ChatReply, ChatError> {
        let reply = self.answer(question)?;
        self.broadcast.publish_json(&reply);
        Ok(reply)
    }

    /// Answer a question without broadcasting, e.g. straight back over the
    /// socket that asked it.
    pub fn answer(&self, question: &str) -> Result<ChatReply, ChatError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let now = Utc::now();
        self.expire_overdue(now);
        self.stats.record_chat_request();

        let snapshot = Arc::new(self.context.build_default());
        let fallback = self.responder.respond(question, &snapshot);
        let exchange = ChatExchange::new(question, snapshot, fallback.clone(), now, self.deadline);
        let id = exchange.id;

        // Stored before publishing so an answer delivered during publish still correlates
        self.retain(exchange.clone());
        self.push_history(Speaker::User, question, now);
        self.push_history(Speaker::Assistant, &fallback, now);
        self.publish_query(&exchange);

        debug!(request_id = %id, "answered chat question from fallback");
        Ok(ChatReply::response(fallback, now).for_request(id))
    }

    /// Handle a payload from the chat response topic.
    pub fn on_response(&self, payload: &[u8]) -> Result<AnswerOutcome, ChatError> {
        let answer: ChatAnswer = serde_json::from_slice(payload)
            .map_err(|e| ChatError::MalformedAnswer(e.to_string()))?;
        let now = Utc::now();
        self.expire_overdue(now);
        self.stats.record_async_answer();

        let outcome = self.correlate(&answer, now);
        match outcome {
            AnswerOutcome::Resolved(id) => debug!(request_id = %id, "chat exchange resolved"),
            AnswerOutcome::Late(id) => {
                info!(request_id = %id, "answer arrived after deadline; broadcasting anyway")
            }
            AnswerOutcome::Duplicate(id) => debug!(request_id = %id, "duplicate answer ignored"),
            AnswerOutcome::Unmatched => debug!("answer matched no known exchange"),
        }
        if !outcome.broadcasts() {
            return Ok(outcome);
        }

        self.push_history(Speaker::Assistant, &answer.response, now);
        let mut reply = ChatReply::response(answer.response, now);
        if let AnswerOutcome::Resolved(id) | AnswerOutcome::Late(id) = outcome {
            reply = reply.for_request(id);
        }
        self.broadcast.publish_json(&reply);
        Ok(outcome)
    }

    /// Time out every pending exchange whose deadline is at or before `now`.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let mut exchanges = self.exchanges.lock().unwrap_or_else(|p| p.into_inner());
        let mut expired = 0;
        for exchange in exchanges.iter_mut().filter(|e| e.is_overdue(now)) {
            exchange.time_out();
            expired += 1;
            info!(request_id = %exchange.id, "chat exchange timed out");
        }
        drop(exchanges);

        if expired > 0 {
            self.stats.record_chat_timeouts(expired as u64);
        }
        expired
    }

    /// A copy of one exchange.
    pub fn exchange(&self, id: Uuid) -> Option<ChatExchange> {
        self.exchanges
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.exchanges
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.is_pending())
            .count()
    }

    /// Chat history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn publish_query(&self, exchange: &ChatExchange) {
        let Some(ref bus) = self.bus else {
            return;
        };
        let query = ChatQuery {
            kind: "chat_query".to_string(),
            request_id: exchange.id,
            message: exchange.question.clone(),
            enhanced_prompt: enhanced_prompt(&exchange.question, &exchange.snapshot),
            context: status_view(&exchange.snapshot),
            timestamp: exchange.created_at,
        };
        if let Err(e) = publish_json(bus.as_ref(), &self.request_topic, &query) {
            self.stats.record_bus_failure();
            warn!(request_id = %exchange.id, "failed to publish chat request: {e}");
        }
    }

    fn correlate(&self, answer: &ChatAnswer, now: DateTime<Utc>) -> AnswerOutcome {
        let mut exchanges = self.exchanges.lock().unwrap_or_else(|p| p.into_inner());

        let matched = match (answer.request_id, answer.original_message.as_deref()) {
            (Some(id), _) => exchanges.iter_mut().find(|e| e.id == id),
            // Without an id, prefer the oldest pending exchange for the same question
            (None, Some(question)) => {
                let question = question.trim();
                let index = exchanges
                    .iter()
                    .position(|e| e.is_pending() && e.question == question)
                    .or_else(|| exchanges.iter().rposition(|e| e.question == question));
                index.and_then(|i| exchanges.get_mut(i))
            }
            (None, None) => None,
        };

        match matched {
            Some(exchange) => {
                let id = exchange.id;
                if exchange.resolve(&answer.response, now) {
                    AnswerOutcome::Resolved(id)
                } else if exchange.state == ExchangeState::TimedOut {
                    AnswerOutcome::Late(id)
                } else {
                    AnswerOutcome::Duplicate(id)
                }
            }
            None => AnswerOutcome::Unmatched,
        }
    }

    fn retain(&self, exchange: ChatExchange) {
        let mut exchanges = self.exchanges.lock().unwrap_or_else(|p| p.into_inner());
        exchanges.push_back(exchange);
        while exchanges.len() > RETAINED_EXCHANGES {
            // Drop the oldest finished exchange, or the oldest outright
            let index = exchanges.iter().position(|e| !e.is_pending()).unwrap_or(0);
            exchanges.remove(index);
        }
    }

    fn push_history(&self, speaker: Speaker, message: &str, timestamp: DateTime<Utc>) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(HistoryEntry {
            speaker,
            message: message.to_string(),
            timestamp,
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

/// Periodically time out overdue exchanges until the task is aborted.
pub async fn run_deadline_sweeper(correlator: Arc<ChatCorrelator>, period: Duration) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        correlator.expire_overdue(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastRegistry, ChannelListener};
    use crate::bus::LocalBus;
    use crate::config::Config;
    use crate::core::anomaly::{AnalysisLog, AnomalyLog};
    use crate::core::classifier::Classifier;
    use crate::core::windowing::WindowAggregator;
    use crate::stats::create_shared_stats;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        correlator: Arc<ChatCorrelator>,
        requests: crossbeam_channel::Receiver<crate::bus::BusMessage>,
        listener: UnboundedReceiver<String>,
        stats: SharedPipelineStats,
    }

    fn fixture(deadline: Duration) -> Fixture {
        let config = Config::default();
        let stats = create_shared_stats();
        let classifier = Arc::new(Classifier::from_config(&config));
        let aggregator = Arc::new(WindowAggregator::from_config(&config, classifier.clone()));
        let context = Arc::new(ContextBuilder::new(
            aggregator,
            Arc::new(AnomalyLog::new(10)),
            Arc::new(AnalysisLog::new(10)),
            config.window_durations.clone(),
            10,
        ));
        let registry = Arc::new(BroadcastRegistry::new().with_stats(stats.clone()));
        let (tx, listener) = tokio::sync::mpsc::unbounded_channel();
        registry.register(Arc::new(ChannelListener::new(tx)));

        let bus = Arc::new(LocalBus::new());
        let requests = bus.subscribe(&["local/chat/requests"]);
        let correlator = ChatCorrelator::new(
            context,
            FallbackResponder::new(classifier),
            registry,
            stats.clone(),
        )
        .with_bus(bus, "local/chat/requests")
        .with_deadline(deadline)
        .with_history_limit(4);

        Fixture {
            correlator: Arc::new(correlator),
            requests,
            listener,
            stats,
        }
    }

    fn reply(message: &str) -> ChatReply {
        serde_json::from_str(message).unwrap()
    }

    #[test]
    fn test_empty_question_rejected() {
        let f = fixture(Duration::from_secs(30));
        assert!(matches!(f.correlator.ask("   "), Err(ChatError::EmptyMessage)));
        assert!(f.requests.try_recv().is_err());
    }

    #[test]
    fn test_ask_answers_with_fallback_and_publishes_request() {
        let mut f = fixture(Duration::from_secs(30));
        let answer = f.correlator.ask("What's the status?").unwrap();
        assert_eq!(answer.kind, "response");
        assert!(answer.message.contains("don't have recent sensor data"));

        let request = f.requests.try_recv().unwrap();
        let query: ChatQuery = serde_json::from_slice(&request.payload).unwrap();
        assert_eq!(query.kind, "chat_query");
        assert_eq!(Some(query.request_id), answer.request_id);
        assert!(query.enhanced_prompt.contains("User question: What's the status?"));
        assert_eq!(query.context["status"], "No recent sensor data available");

        assert_eq!(reply(&f.listener.try_recv().unwrap()).message, answer.message);
        assert_eq!(f.correlator.pending_count(), 1);
    }

    #[test]
    fn test_async_answer_resolves_and_broadcasts() {
        let mut f = fixture(Duration::from_secs(30));
        let answer = f.correlator.ask("status").unwrap();
        let id = answer.request_id.unwrap();
        f.listener.try_recv().unwrap();

        let payload = serde_json::json!({"request_id": id, "response": "All good."});
        let outcome = f
            .correlator
            .on_response(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Resolved(id));

        let exchange = f.correlator.exchange(id).unwrap();
        assert_eq!(exchange.state, ExchangeState::Resolved);
        assert_eq!(exchange.answer.as_deref(), Some("All good."));
        assert_eq!(reply(&f.listener.try_recv().unwrap()).message, "All good.");

        // redelivery is not broadcast twice
        let outcome = f
            .correlator
            .on_response(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Duplicate(id));
        assert!(f.listener.try_recv().is_err());
    }

    #[test]
    fn test_answer_correlated_by_question_text() {
        let f = fixture(Duration::from_secs(30));
        let id = f.correlator.ask("any alerts?").unwrap().request_id.unwrap();
        let payload = br#"{"type": "chat_response", "original_message": "any alerts?", "response": "None."}"#;
        assert_eq!(
            f.correlator.on_response(payload).unwrap(),
            AnswerOutcome::Resolved(id)
        );
    }

    #[test]
    fn test_late_answer_still_broadcast() {
        let mut f = fixture(Duration::ZERO);
        let id = f.correlator.ask("status").unwrap().request_id.unwrap();
        f.listener.try_recv().unwrap();

        assert_eq!(f.correlator.expire_overdue(Utc::now()), 1);
        assert_eq!(f.stats.snapshot().chat_timeouts, 1);

        let payload = serde_json::json!({"request_id": id, "response": "Late insight."});
        let outcome = f
            .correlator
            .on_response(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(outcome, AnswerOutcome::Late(id));
        assert_eq!(reply(&f.listener.try_recv().unwrap()).message, "Late insight.");

        let exchange = f.correlator.exchange(id).unwrap();
        assert_eq!(exchange.state, ExchangeState::TimedOut);
        assert!(exchange.answer.is_none());
    }

    #[test]
    fn test_unmatched_answer_broadcast_and_malformed_rejected() {
        let mut f = fixture(Duration::from_secs(30));
        let outcome = f.correlator.on_response(br#"{"response": "hello"}"#).unwrap();
        assert_eq!(outcome, AnswerOutcome::Unmatched);
        assert_eq!(reply(&f.listener.try_recv().unwrap()).message, "hello");
        assert!(f.correlator.on_response(b"not json").is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let f = fixture(Duration::from_secs(30));
        f.correlator.ask("one").unwrap();
        f.correlator.ask("two").unwrap();
        f.correlator.ask("three").unwrap();
        let history = f.correlator.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].speaker, Speaker::User);
        assert_eq!(history[0].message, "two");
    }

    /// Answers every chat request from inside `publish`, before it returns.
    struct InlineResponder {
        correlator: std::sync::OnceLock<std::sync::Weak<ChatCorrelator>>,
        outcomes: Mutex<Vec<AnswerOutcome>>,
    }

    impl BusPublisher for InlineResponder {
        fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<(), crate::bus::BusError> {
            let query: ChatQuery = serde_json::from_slice(&payload).unwrap();
            let correlator = self.correlator.get().and_then(|w| w.upgrade()).unwrap();
            let answer = serde_json::json!({"request_id": query.request_id, "response": "fast"});
            let outcome = correlator
                .on_response(answer.to_string().as_bytes())
                .unwrap();
            self.outcomes.lock().unwrap().push(outcome);
            Ok(())
        }
    }

    #[test]
    fn test_answer_delivered_during_publish_resolves() {
        let config = Config::default();
        let stats = create_shared_stats();
        let classifier = Arc::new(Classifier::from_config(&config));
        let aggregator = Arc::new(WindowAggregator::from_config(&config, classifier.clone()));
        let context = Arc::new(ContextBuilder::new(
            aggregator,
            Arc::new(AnomalyLog::new(10)),
            Arc::new(AnalysisLog::new(10)),
            config.window_durations.clone(),
            10,
        ));
        let bus = Arc::new(InlineResponder {
            correlator: std::sync::OnceLock::new(),
            outcomes: Mutex::new(Vec::new()),
        });
        let correlator = Arc::new(
            ChatCorrelator::new(
                context,
                FallbackResponder::new(classifier),
                Arc::new(BroadcastRegistry::new()),
                stats,
            )
            .with_bus(bus.clone(), "local/chat/requests"),
        );
        let _ = bus.correlator.set(Arc::downgrade(&correlator));

        let id = correlator.ask("status").unwrap().request_id.unwrap();

        assert_eq!(*bus.outcomes.lock().unwrap(), vec![AnswerOutcome::Resolved(id)]);
        let exchange = correlator.exchange(id).unwrap();
        assert_eq!(exchange.state, ExchangeState::Resolved);
        assert_eq!(exchange.answer.as_deref(), Some("fast"));

        let history = correlator.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].speaker, Speaker::User);
        assert_eq!(history[2].message, "fast");
    }

    #[tokio::test]
    async fn test_sweeper_times_out_pending_exchanges() {
        let f = fixture(Duration::from_millis(20));
        let id = f.correlator.ask("status").unwrap().request_id.unwrap();
        let sweeper = tokio::spawn(run_deadline_sweeper(
            f.correlator.clone(),
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweeper.abort();

        assert_eq!(
            f.correlator.exchange(id).unwrap().state,
            ExchangeState::TimedOut
        );
    }
}
