//! Context-aware prompt sent along with each chat request.

use crate::core::context::ContextSnapshot;
use crate::core::windowing::Summary;
use serde_json::{json, Map, Value};

/// Condensed, display-rounded view of a snapshot.
pub fn status_view(snapshot: &ContextSnapshot) -> Value {
    let Some(primary) = snapshot.primary() else {
        return json!({ "status": "No recent sensor data available" });
    };
    if !primary.has_data() {
        return json!({ "status": "No recent sensor data available" });
    }

    let summaries: Map<String, Value> = primary
        .summaries
        .iter()
        .filter(|(_, summary)| !summary.is_empty())
        .map(|(sensor_type, summary)| {
            (
                sensor_type.clone(),
                summary_view(summary, snapshot.severity(sensor_type).as_str()),
            )
        })
        .collect();

    let recent_anomalies: Vec<Value> = snapshot
        .recent_anomalies
        .iter()
        .map(|a| {
            json!({
                "sensor_id": a.sensor_id,
                "type": a.sensor_type,
                "value": a.value,
                "unit": a.unit,
                "severity": a.severity,
                "timestamp": a.timestamp.to_rfc3339(),
            })
        })
        .collect();

    json!({
        "window": primary.label(),
        "sensor_summaries": summaries,
        "total_readings": primary.total_readings,
        "total_anomalies": snapshot.total_anomaly_count,
        "recent_anomalies": recent_anomalies,
        "latest_analysis": snapshot.recent_analyses,
    })
}

fn summary_view(summary: &Summary, severity: &str) -> Value {
    let rounded = summary.rounded();
    json!({
        "count": rounded.count,
        "mean": rounded.mean,
        "min": rounded.min,
        "max": rounded.max,
        "anomaly_count": rounded.anomaly_count,
        "unit": rounded.unit,
        "severity": severity,
    })
}

/// Build the prompt for the reasoning service.
pub fn enhanced_prompt(question: &str, snapshot: &ContextSnapshot) -> String {
    let status = serde_json::to_string_pretty(&status_view(snapshot))
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        "You are an industrial IoT assistant with access to real-time sensor data.\n\
         \n\
         Current sensor status:\n\
         {status}\n\
         \n\
         User question: {question}\n\
         \n\
         Answer from the sensor data above. Cover:\n\
         - Current system status and health\n\
         - Anomalies or patterns in the data\n\
         - Actionable recommendations\n\
         \n\
         Keep the answer concise and practical."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::WindowContext;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snapshot(summaries: BTreeMap<String, Summary>) -> ContextSnapshot {
        let total_readings = summaries.values().map(|s| s.count).sum();
        ContextSnapshot {
            windows: vec![WindowContext {
                window_secs: 1800,
                summaries,
                severities: BTreeMap::new(),
                total_readings,
                total_anomalies: 0,
            }],
            total_anomaly_count: 0,
            generated_at: Utc::now(),
            recent_anomalies: Vec::new(),
            recent_analyses: Vec::new(),
        }
    }

    #[test]
    fn test_empty_snapshot_says_no_data() {
        let view = status_view(&snapshot(BTreeMap::new()));
        assert_eq!(view["status"], "No recent sensor data available");
    }

    #[test]
    fn test_prompt_embeds_rounded_status_and_question() {
        let mut summaries = BTreeMap::new();
        summaries.insert(
            "temperature".to_string(),
            Summary {
                count: 3,
                mean: 23.374333,
                min: 22.0,
                max: 25.123,
                anomaly_count: 0,
                unit: "celsius".to_string(),
            },
        );
        summaries.insert("pressure".to_string(), Summary::empty("kPa"));

        let prompt = enhanced_prompt("Is it hot?", &snapshot(summaries));
        assert!(prompt.contains("User question: Is it hot?"));
        assert!(prompt.contains("\"mean\": 23.37"));
        assert!(prompt.contains("\"window\": \"last 30 minutes\""));
        assert!(!prompt.contains("pressure"));
    }
}
