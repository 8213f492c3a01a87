//! End-to-end tests through the bus dispatcher.

use chrono::{Duration as ChronoDuration, Utc};
use edge_sensor_copilot::{
    broadcast::{ChannelListener, DeliveryError, Listener},
    bus::{BusMessage, LocalBus},
    chat::{AnswerOutcome, ChatReply, ExchangeState},
    pipeline::Dispatch,
    Config, Pipeline, SeverityTier,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn reading(
    sensor_id: &str,
    sensor_type: &str,
    value: f64,
    flagged: bool,
    age_secs: i64,
) -> BusMessage {
    let timestamp = Utc::now() - ChronoDuration::seconds(age_secs);
    BusMessage::json(
        format!("local/sensors/{sensor_id}"),
        &json!({
            "sensor_id": sensor_id,
            "type": sensor_type,
            "value": value,
            "unit": "celsius",
            "timestamp": timestamp.to_rfc3339(),
            "is_anomaly": flagged,
            "location": "engine_room",
        }),
    )
    .unwrap()
}

#[test]
fn test_producer_flag_overridden_by_thresholds() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus.clone());
    let analyses = bus.subscribe(&["local/analysis/results"]);
    let dispatcher = pipeline.dispatcher();

    let mut tiers = Vec::new();
    let feed = [
        (22.0, false),
        (25.0, false),
        (90.0, true),
        (24.0, false),
        (23.0, false),
    ];
    for (value, flagged) in feed {
        match dispatcher.handle(&reading("temperature_01", "temperature", value, flagged, 60)) {
            Dispatch::Reading(tier) => tiers.push(tier),
            other => panic!("unexpected dispatch: {other:?}"),
        }
    }

    assert!(tiers.iter().all(|t| *t == SeverityTier::Normal));
    let summary = pipeline
        .aggregator()
        .summarize("temperature", Duration::from_secs(1800));
    assert_eq!(summary.count, 5);
    assert_eq!(summary.anomaly_count, 0);
    assert_eq!(summary.max, 90.0);
    assert!((summary.mean - 36.8).abs() < 1e-9);
    assert!(pipeline.anomalies().is_empty());
    assert!(analyses.try_recv().is_err());
}

#[test]
fn test_chat_without_data_says_so() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus.clone());

    let snapshot = pipeline.context().build_default();
    assert!(snapshot
        .windows
        .iter()
        .all(|w| w.summaries.values().all(|s| s.count == 0)));

    for question in ["What is the current status?", "Any anomalies?", "How hot is it?"] {
        let reply = pipeline.correlator().ask(question).unwrap();
        assert_eq!(reply.kind, "response");
        assert!(
            reply.message.contains("don't have recent sensor data"),
            "{question}: {}",
            reply.message
        );
    }
}

#[test]
fn test_old_readings_do_not_contribute() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus);
    let dispatcher = pipeline.dispatcher();

    dispatcher.handle(&reading("t1", "temperature", 70.0, false, 45 * 60));
    dispatcher.handle(&reading("t1", "temperature", 30.0, false, 60));
    dispatcher.handle(&reading("t1", "temperature", 50.0, false, 2 * 60 * 60));

    let recent = pipeline
        .aggregator()
        .summarize("temperature", Duration::from_secs(1800));
    assert_eq!(recent.count, 1);
    assert_eq!(recent.mean, 30.0);

    let hour = pipeline
        .aggregator()
        .summarize("temperature", Duration::from_secs(3600));
    assert_eq!(hour.count, 2);
    assert_eq!(hour.min, 30.0);
    assert_eq!(hour.max, 70.0);
}

#[test]
fn test_redelivered_anomaly_published_once() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus.clone());
    let analyses = bus.subscribe(&["local/analysis/results"]);
    let dispatcher = pipeline.dispatcher();

    let message = reading("t1", "temperature", 110.0, true, 10);
    assert_eq!(dispatcher.handle(&message), Dispatch::Reading(SeverityTier::Warning));
    dispatcher.handle(&message);

    assert_eq!(analyses.len(), 1);
    let result: serde_json::Value =
        serde_json::from_slice(&analyses.recv().unwrap().payload).unwrap();
    assert_eq!(result["type"], "anomaly_detection");
    assert_eq!(result["severity"], "warning");
    assert_eq!(pipeline.anomalies().total(), 1);
}

#[test]
fn test_snapshots_idempotent_without_observe() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus);
    let dispatcher = pipeline.dispatcher();
    dispatcher.handle(&reading("t1", "temperature", 150.0, false, 30));
    dispatcher.handle(&reading("p1", "pressure", 150.0, false, 30));

    let now = Utc::now();
    let windows = pipeline.config().window_durations.clone();
    let first = pipeline.context().build_at(&windows, now);
    let second = pipeline.context().build_at(&windows, now);
    assert_eq!(first, second);
    assert_eq!(first.total_anomaly_count, 1);
    assert_eq!(first.severity("temperature"), SeverityTier::Critical);
}

struct Failing;

impl Listener for Failing {
    fn deliver(&self, _message: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::Closed)
    }
}

#[test]
fn test_async_answer_broadcast_isolated_from_failed_listener() {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(Config::default(), bus.clone());
    let requests = bus.subscribe(&["local/chat/requests"]);
    let dispatcher = pipeline.dispatcher();

    let (tx1, mut rx1) = tokio::sync::mpsc::unbounded_channel();
    let (tx3, mut rx3) = tokio::sync::mpsc::unbounded_channel();
    pipeline.broadcast().register(Arc::new(ChannelListener::new(tx1)));
    let failing = pipeline.broadcast().register(Arc::new(Failing));
    pipeline.broadcast().register(Arc::new(ChannelListener::new(tx3)));

    let reply = pipeline.correlator().ask("status").unwrap();
    assert!(!pipeline.broadcast().contains(failing));

    let request: serde_json::Value =
        serde_json::from_slice(&requests.recv().unwrap().payload).unwrap();
    assert_eq!(request["type"], "chat_query");
    let request_id = request["request_id"].as_str().unwrap().to_string();

    let answer = BusMessage::json(
        "local/chat/responses",
        &json!({
            "type": "chat_response",
            "request_id": request_id,
            "original_message": "status",
            "response": "Everything is nominal.",
        }),
    )
    .unwrap();
    let id = reply.request_id.unwrap();
    assert_eq!(dispatcher.handle(&answer), Dispatch::Answer(AnswerOutcome::Resolved(id)));

    for rx in [&mut rx1, &mut rx3] {
        let first: ChatReply = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: ChatReply = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first.message, reply.message);
        assert_eq!(second.message, "Everything is nominal.");
    }
    assert_eq!(
        pipeline.correlator().exchange(id).unwrap().state,
        ExchangeState::Resolved
    );
}

#[test]
fn test_answer_after_deadline_still_broadcast() {
    let bus = Arc::new(LocalBus::new());
    let config = Config {
        chat_deadline: Duration::ZERO,
        ..Config::default()
    };
    let pipeline = Pipeline::new(config, bus);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    pipeline.broadcast().register(Arc::new(ChannelListener::new(tx)));

    let id = pipeline.correlator().ask("status").unwrap().request_id.unwrap();
    rx.try_recv().unwrap();
    pipeline.correlator().expire_overdue(Utc::now());

    let answer = BusMessage::json(
        "local/chat/responses",
        &json!({ "request_id": id, "response": "Late but useful." }),
    )
    .unwrap();
    assert_eq!(
        pipeline.dispatcher().handle(&answer),
        Dispatch::Answer(AnswerOutcome::Late(id))
    );
    let late: ChatReply = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(late.message, "Late but useful.");
    assert_eq!(
        pipeline.correlator().exchange(id).unwrap().state,
        ExchangeState::TimedOut
    );
    assert_eq!(pipeline.stats().snapshot().chat_timeouts, 1);
}
