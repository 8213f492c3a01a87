//! Pipeline wiring and bus dispatch.
//!
//! `Pipeline` builds every component from a `Config` and a bus handle.
//! `Dispatcher::handle` is the single entry point for inbound bus traffic: it
//! routes sensor readings to the ingestor, analysis results to the analysis log,
//! and chat answers to the correlator. It makes no assumption about the calling
//! thread.

use crate::broadcast::{BroadcastRegistry, SharedBroadcastRegistry};
use crate::bus::{topic_matches, BusMessage, BusPublisher};
use crate::chat::{AnswerOutcome, ChatCorrelator, FallbackResponder};
use crate::config::{Config, TopicConfig};
use crate::core::anomaly::{AnalysisLog, AnomalyLog};
use crate::core::classifier::{Classifier, SeverityTier};
use crate::core::context::{describe_window, ContextBuilder};
use crate::core::windowing::WindowAggregator;
use crate::ingest::{Ingestor, RejectReason};
use crate::stats::{create_shared_stats, SharedPipelineStats};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Every component of a running pipeline.
pub struct Pipeline {
    config: Config,
    stats: SharedPipelineStats,
    classifier: Arc<Classifier>,
    aggregator: Arc<WindowAggregator>,
    anomalies: Arc<AnomalyLog>,
    analyses: Arc<AnalysisLog>,
    context: Arc<ContextBuilder>,
    broadcast: SharedBroadcastRegistry,
    ingestor: Arc<Ingestor>,
    correlator: Arc<ChatCorrelator>,
}

impl Pipeline {
    /// Build the pipeline. The ingestor and the correlator each get their own
    /// handle on `bus` for publishing.
    pub fn new(config: Config, bus: Arc<dyn BusPublisher>) -> Self {
        let stats = create_shared_stats();
        let classifier = Arc::new(Classifier::from_config(&config).with_stats(stats.clone()));
        let aggregator = Arc::new(WindowAggregator::from_config(&config, classifier.clone()));
        let anomalies = Arc::new(AnomalyLog::new(config.recent_anomaly_limit.max(1)));
        let analyses = Arc::new(AnalysisLog::new(config.analysis_history_limit.max(1)));
        let context = Arc::new(ContextBuilder::new(
            aggregator.clone(),
            anomalies.clone(),
            analyses.clone(),
            config.window_durations.clone(),
            config.recent_anomaly_limit,
        ));
        let broadcast = Arc::new(BroadcastRegistry::new().with_stats(stats.clone()));

        let ingestor = Arc::new(
            Ingestor::new(aggregator.clone(), anomalies.clone(), stats.clone())
                .with_analysis_publisher(
                    Arc::clone(&bus),
                    config.topics.analysis_results.clone(),
                    config.node_id.clone(),
                ),
        );
        let correlator = Arc::new(
            ChatCorrelator::new(
                context.clone(),
                FallbackResponder::new(classifier.clone()),
                broadcast.clone(),
                stats.clone(),
            )
            .with_bus(bus, config.topics.chat_requests.clone())
            .with_deadline(config.chat_deadline)
            .with_history_limit(config.chat_history_limit),
        );

        Self {
            config,
            stats,
            classifier,
            aggregator,
            anomalies,
            analyses,
            context,
            broadcast,
            ingestor,
            correlator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &SharedPipelineStats {
        &self.stats
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    pub fn aggregator(&self) -> &Arc<WindowAggregator> {
        &self.aggregator
    }

    pub fn anomalies(&self) -> &Arc<AnomalyLog> {
        &self.anomalies
    }

    pub fn analyses(&self) -> &Arc<AnalysisLog> {
        &self.analyses
    }

    pub fn context(&self) -> &Arc<ContextBuilder> {
        &self.context
    }

    pub fn broadcast(&self) -> &SharedBroadcastRegistry {
        &self.broadcast
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    pub fn correlator(&self) -> &Arc<ChatCorrelator> {
        &self.correlator
    }

    /// Topic filters the bus adapter must subscribe to.
    pub fn subscriptions(&self) -> Vec<&str> {
        vec![
            self.config.topics.sensor_readings.as_str(),
            self.config.topics.analysis_results.as_str(),
            self.config.topics.chat_responses.as_str(),
        ]
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            topics: self.config.topics.clone(),
            ingestor: self.ingestor.clone(),
            analyses: self.analyses.clone(),
            correlator: self.correlator.clone(),
        }
    }

    /// Per-type summaries over the longest configured window.
    pub fn sensor_summary(&self) -> SensorSummary {
        let window = self.config.longest_window();
        let snapshot = self.context.build(&[window]);
        let Some(context) = snapshot.primary().filter(|w| w.has_data()) else {
            return SensorSummary::Empty {
                message: "No recent sensor data available".to_string(),
            };
        };

        let sensors = context
            .summaries
            .iter()
            .filter(|(_, summary)| !summary.is_empty())
            .map(|(sensor_type, summary)| {
                let rounded = summary.rounded();
                (
                    sensor_type.clone(),
                    SensorStatus {
                        count: rounded.count,
                        avg: rounded.mean,
                        min: rounded.min,
                        max: rounded.max,
                        anomalies: rounded.anomaly_count,
                        unit: rounded.unit,
                        severity: snapshot.severity(sensor_type),
                    },
                )
            })
            .collect();

        SensorSummary::Window {
            window: describe_window(window),
            window_secs: window.as_secs(),
            sensors,
        }
    }
}

/// Display view of one sensor type's summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorStatus {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub anomalies: usize,
    pub unit: String,
    pub severity: SeverityTier,
}

/// Response of the sensor summary view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorSummary {
    Empty {
        message: String,
    },
    Window {
        window: String,
        window_secs: u64,
        sensors: BTreeMap<String, SensorStatus>,
    },
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Reading(SeverityTier),
    Rejected(RejectReason),
    Analysis,
    Answer(AnswerOutcome),
    Ignored,
}

/// Routes inbound bus messages by topic.
#[derive(Clone)]
pub struct Dispatcher {
    topics: TopicConfig,
    ingestor: Arc<Ingestor>,
    analyses: Arc<AnalysisLog>,
    correlator: Arc<ChatCorrelator>,
}

impl Dispatcher {
    /// Handle one inbound message. Never fails; problems are logged and counted.
    pub fn handle(&self, message: &BusMessage) -> Dispatch {
        let topic = message.topic.as_str();

        if topic_matches(&self.topics.sensor_readings, topic) {
            return match self.ingestor.ingest(&message.payload) {
                Ok((_, severity)) => Dispatch::Reading(severity),
                Err(reason) => Dispatch::Rejected(reason),
            };
        }

        if topic_matches(&self.topics.analysis_results, topic) {
            return match serde_json::from_slice::<serde_json::Value>(&message.payload) {
                Ok(result) => {
                    self.analyses.push(result);
                    Dispatch::Analysis
                }
                Err(e) => {
                    debug!(topic, "ignoring undecodable analysis result: {e}");
                    Dispatch::Ignored
                }
            };
        }

        if topic_matches(&self.topics.chat_responses, topic) {
            return match self.correlator.on_response(&message.payload) {
                Ok(outcome) => Dispatch::Answer(outcome),
                Err(e) => {
                    warn!(topic, "dropping chat answer: {e}");
                    Dispatch::Ignored
                }
            };
        }

        debug!(topic, "no route for topic");
        Dispatch::Ignored
    }
}

/// Feed messages from `receiver` to `dispatcher` until `running` is cleared or
/// every sender is gone. Returns the number of messages handled.
pub fn run_dispatch_loop(
    dispatcher: &Dispatcher,
    receiver: &Receiver<BusMessage>,
    running: &AtomicBool,
) -> u64 {
    let mut handled = 0;
    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(message) => {
                dispatcher.handle(&message);
                handled += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("bus feed closed");
                break;
            }
        }
    }
    handled
}

/// Handle everything already queued on `receiver`, including messages the
/// handling itself publishes back onto subscribed topics.
pub fn drain_pending(dispatcher: &Dispatcher, receiver: &Receiver<BusMessage>) -> u64 {
    let mut handled = 0;
    while let Ok(message) = receiver.try_recv() {
        dispatcher.handle(&message);
        handled += 1;
    }
    handled
}

/// Spawn the dispatch loop on its own thread.
pub fn spawn_dispatch_loop(
    dispatcher: Dispatcher,
    receiver: Receiver<BusMessage>,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<u64> {
    std::thread::spawn(move || run_dispatch_loop(&dispatcher, &receiver, &running))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use chrono::Utc;
    use serde_json::json;

    fn pipeline() -> (Pipeline, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        (Pipeline::new(Config::default(), bus.clone()), bus)
    }

    fn reading(value: f64) -> BusMessage {
        BusMessage::json(
            "local/sensors/temperature_01",
            &json!({
                "sensor_id": "temperature_01",
                "type": "temperature",
                "value": value,
                "unit": "celsius",
                "timestamp": Utc::now().to_rfc3339(),
                "is_anomaly": false,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_routes_by_topic() {
        let (pipeline, _bus) = pipeline();
        let dispatcher = pipeline.dispatcher();

        assert_eq!(
            dispatcher.handle(&reading(25.0)),
            Dispatch::Reading(SeverityTier::Normal)
        );
        assert!(matches!(
            dispatcher.handle(&BusMessage::new("local/sensors/x", b"nope".to_vec())),
            Dispatch::Rejected(_)
        ));
        assert_eq!(
            dispatcher.handle(&BusMessage::new(
                "local/analysis/results",
                br#"{"type": "anomaly_detection"}"#.to_vec()
            )),
            Dispatch::Analysis
        );
        assert_eq!(
            dispatcher.handle(&BusMessage::new(
                "local/chat/responses",
                br#"{"response": "hi"}"#.to_vec()
            )),
            Dispatch::Answer(AnswerOutcome::Unmatched)
        );
        assert_eq!(
            dispatcher.handle(&BusMessage::new("elsewhere", b"{}".to_vec())),
            Dispatch::Ignored
        );
        assert_eq!(pipeline.analyses().len(), 1);
    }

    #[test]
    fn test_anomaly_round_trips_through_analysis_topic() {
        let (pipeline, bus) = pipeline();
        let feed = bus.subscribe(&pipeline.subscriptions());
        let dispatcher = pipeline.dispatcher();

        dispatcher.handle(&reading(150.0));
        // the published analysis comes back on the subscribed topic
        let message = feed.try_recv().unwrap();
        assert_eq!(message.topic, "local/analysis/results");
        assert_eq!(dispatcher.handle(&message), Dispatch::Analysis);

        let snapshot = pipeline.context().build_default();
        assert_eq!(snapshot.recent_analyses.len(), 1);
        assert_eq!(snapshot.recent_anomalies.len(), 1);
        assert_eq!(snapshot.total_anomaly_count, 1);
    }

    #[test]
    fn test_drain_pending_picks_up_analysis_published_while_handling() {
        let (pipeline, bus) = pipeline();
        let feed = bus.subscribe(&pipeline.subscriptions());
        let message = reading(150.0);
        bus.publish(&message.topic, message.payload).unwrap();

        // reading, then the analysis it published
        assert_eq!(drain_pending(&pipeline.dispatcher(), &feed), 2);
        assert_eq!(pipeline.analyses().len(), 1);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_sensor_summary_empty_and_rounded() {
        let (pipeline, _bus) = pipeline();
        assert_eq!(
            pipeline.sensor_summary(),
            SensorSummary::Empty {
                message: "No recent sensor data available".to_string()
            }
        );

        let dispatcher = pipeline.dispatcher();
        dispatcher.handle(&reading(22.0));
        dispatcher.handle(&reading(25.123));
        match pipeline.sensor_summary() {
            SensorSummary::Window {
                window, sensors, ..
            } => {
                assert_eq!(window, "last hour");
                let temperature = &sensors["temperature"];
                assert_eq!(temperature.count, 2);
                assert_eq!(temperature.avg, 23.56);
                assert_eq!(temperature.max, 25.12);
                assert!(!sensors.contains_key("pressure"));
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_loop_stops_when_feed_closes() {
        let (pipeline, _bus) = pipeline();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(reading(30.0)).unwrap();
        tx.send(reading(31.0)).unwrap();
        drop(tx);

        let running = AtomicBool::new(true);
        assert_eq!(run_dispatch_loop(&pipeline.dispatcher(), &rx, &running), 2);
        assert_eq!(pipeline.aggregator().observed_count(), 2);
    }
}
