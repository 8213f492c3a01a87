//! Intent detection and deterministic fallback answers.
//!
//! Intents are matched by an ordered rule table: the first rule with a keyword
//! in the question wins. Sensor intents are generated from the configured
//! sensor types and their aliases, so adding a sensor type adds an intent.

use crate::core::classifier::Classifier;
use crate::core::context::{ContextSnapshot, WindowContext};
use crate::core::windowing::round2;
use std::sync::Arc;

/// What an operator's question is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Status,
    Anomaly,
    Sensor(String),
    General,
}

const STATUS_KEYWORDS: &[&str] = &["status", "how", "current", "now", "overview", "health"];
const ANOMALY_KEYWORDS: &[&str] = &["anomal", "alert", "problem", "issue", "wrong", "fault"];

#[derive(Debug, Clone)]
struct IntentRule {
    intent: Intent,
    keywords: Vec<String>,
}

/// Ordered keyword rules mapping questions to intents.
#[derive(Debug, Clone, Default)]
pub struct IntentTable {
    rules: Vec<IntentRule>,
}

impl IntentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Earlier rules take precedence.
    pub fn rule(mut self, intent: Intent, keywords: &[&str]) -> Self {
        self.rules.push(IntentRule {
            intent,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        });
        self
    }

    /// Status and anomaly rules followed by one rule per configured sensor type.
    pub fn for_classifier(classifier: &Classifier) -> Self {
        let mut table = Self::new()
            .rule(Intent::Status, STATUS_KEYWORDS)
            .rule(Intent::Anomaly, ANOMALY_KEYWORDS);

        for sensor_type in classifier.sensor_types() {
            let mut keywords = vec![sensor_type];
            if let Some(thresholds) = classifier.thresholds(sensor_type) {
                keywords.extend(thresholds.aliases.iter().map(|a| a.as_str()));
            }
            table = table.rule(Intent::Sensor(sensor_type.to_string()), &keywords);
        }
        table
    }

    /// Match a question. Keywords match the start of any word, case-insensitively.
    pub fn classify(&self, question: &str) -> Intent {
        let question = question.to_lowercase();
        let words: Vec<&str> = question
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();

        self.rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|k| words.iter().any(|w| w.starts_with(k.as_str())))
            })
            .map(|rule| rule.intent.clone())
            .unwrap_or(Intent::General)
    }
}

/// Renders template answers from a context snapshot.
pub struct FallbackResponder {
    intents: IntentTable,
    classifier: Arc<Classifier>,
}

impl FallbackResponder {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self {
            intents: IntentTable::for_classifier(&classifier),
            classifier,
        }
    }

    pub fn with_intents(mut self, intents: IntentTable) -> Self {
        self.intents = intents;
        self
    }

    pub fn intent(&self, question: &str) -> Intent {
        self.intents.classify(question)
    }

    /// Answer `question` from `snapshot` alone.
    pub fn respond(&self, question: &str, snapshot: &ContextSnapshot) -> String {
        let Some(window) = snapshot.primary() else {
            return no_data("the monitored period");
        };
        let label = window.label();

        match self.intent(question) {
            Intent::Status if !window.has_data() => no_data(&label),
            Intent::Status => status(window, &label),
            Intent::Anomaly if !window.has_data() => no_data(&label),
            Intent::Anomaly => anomalies(snapshot, window, &label),
            Intent::Sensor(sensor_type) => self.sensor(snapshot, &sensor_type, &label),
            Intent::General if !window.has_data() => format!(
                "I'm monitoring your sensors, but I don't have recent sensor data for the {label}. \
                 You can ask me about system status, anomalies, or a specific sensor once readings arrive."
            ),
            Intent::General => format!(
                "I'm monitoring your sensors in real time. In the {label} I've processed {} readings \
                 with {} anomalies detected. You can ask me about system status, anomalies, or a \
                 specific sensor such as {}.",
                window.total_readings,
                window.total_anomalies,
                sensor_list(window),
            ),
        }
    }

    fn sensor(&self, snapshot: &ContextSnapshot, sensor_type: &str, label: &str) -> String {
        let summary = match snapshot.summary(sensor_type) {
            Some(summary) if !summary.is_empty() => summary.rounded(),
            _ => return format!("No recent {sensor_type} data available for the {label}."),
        };
        let unit = &summary.unit;
        let severity = snapshot.severity(sensor_type);

        let mut answer = format!(
            "{} over the {label}: average {} {unit}, range {} to {} {unit} across {} readings. Status: {severity}.",
            capitalize(sensor_type),
            summary.mean,
            summary.min,
            summary.max,
            summary.count,
        );
        if summary.anomaly_count > 0 {
            answer.push_str(&format!(" {} readings were anomalous.", summary.anomaly_count));
        }
        if let Some(thresholds) = self.classifier.thresholds(sensor_type) {
            answer.push_str(&format!(
                " Normal range is {} to {} {}.",
                thresholds.min, thresholds.max, thresholds.unit
            ));
        }
        answer
    }
}

fn no_data(label: &str) -> String {
    format!(
        "I don't have recent sensor data for the {label}. Please check that the sensors are \
         connected and transmitting data."
    )
}

fn status(window: &WindowContext, label: &str) -> String {
    if window.total_anomalies == 0 {
        return format!(
            "System status: all sensors are operating normally. I've analyzed {} readings in the {label} with no anomalies detected.",
            window.total_readings
        );
    }

    let elevated: Vec<String> = window
        .severities
        .iter()
        .filter(|(_, severity)| severity.is_anomalous())
        .map(|(sensor_type, severity)| format!("{sensor_type} ({severity})"))
        .collect();
    let mut answer = format!(
        "System status: {} anomalies detected out of {} readings in the {label}.",
        window.total_anomalies, window.total_readings
    );
    if !elevated.is_empty() {
        answer.push_str(&format!(" Elevated: {}.", elevated.join(", ")));
    }
    answer
}

fn anomalies(snapshot: &ContextSnapshot, window: &WindowContext, label: &str) -> String {
    if window.total_anomalies == 0 {
        return format!(
            "No anomalies detected in the {label}. All sensor readings are within expected ranges."
        );
    }

    let mut answer = format!(
        "I've detected {} anomalies in the {label}. These could indicate equipment issues or \
         environmental changes that require attention.",
        window.total_anomalies
    );
    if let Some(latest) = snapshot.recent_anomalies.first() {
        answer.push_str(&format!(
            " Most recent: {} {} reading of {} {} from {} at {}.",
            latest.severity,
            latest.sensor_type,
            round2(latest.value),
            latest.unit,
            latest.sensor_id,
            latest.timestamp.format("%H:%M:%S UTC"),
        ));
    }
    answer
}

fn sensor_list(window: &WindowContext) -> String {
    let names: Vec<&str> = window
        .summaries
        .iter()
        .filter(|(_, summary)| !summary.is_empty())
        .map(|(name, _)| name.as_str())
        .collect();
    if names.is_empty() {
        "temperature".to_string()
    } else {
        names.join(", ")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
