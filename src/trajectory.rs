//! Builds a case's trajectory from OTLP spans, falling back to logs, falling
//! back further to the repository when the in-memory index has nothing
//! (collector disabled, or this process restarted mid-case).

use std::sync::Arc;

use serde_json::{Value, json};

use crate::domain::otel::{Attributes, LogRecord, SpanRecord};
use crate::otel_collector::OtlpCollector;
use crate::repository::Repository;

/// Attribute keys carried into a trajectory step; everything else is dropped
/// so trajectories stay small and comparable across runs.
const ATTRIBUTE_ALLOWLIST: &[&str] = &[
    "tool.name",
    "tool",
    "model",
    "model.name",
    "http.method",
    "http.url",
    "http.status_code",
    "db.system",
    "db.operation",
    "benchmark.run_case_id",
    "benchmark.data_item_id",
];

const FETCH_LIMIT: i64 = 10_000;

pub struct TrajectoryResolver {
    collector: Option<Arc<OtlpCollector>>,
    repository: Arc<dyn Repository>,
}

impl TrajectoryResolver {
    pub fn new(collector: Option<Arc<OtlpCollector>>, repository: Arc<dyn Repository>) -> Self {
        Self { collector, repository }
    }

    pub async fn resolve(&self, run_case_id: &str, start_ms: i64, end_ms: i64) -> anyhow::Result<Vec<Value>> {
        if let Some(collector) = &self.collector {
            let spans = collector.indexed_spans(run_case_id, start_ms, end_ms).await;
            if !spans.is_empty() {
                return Ok(spans_to_trajectory(&spans));
            }
            let logs = collector.indexed_logs(run_case_id, start_ms, end_ms).await;
            if !logs.is_empty() {
                return Ok(logs_to_trajectory(&logs));
            }
        }

        let logs = self.repository.fetch_logs_by_run_case(run_case_id, start_ms, end_ms, FETCH_LIMIT).await?;
        if !logs.is_empty() {
            return Ok(logs_to_trajectory(&logs));
        }

        let spans = self.repository.fetch_spans_by_run_case(run_case_id, start_ms, end_ms, FETCH_LIMIT).await?;
        Ok(spans_to_trajectory(&spans))
    }
}

fn pruned_attributes(attributes: &Attributes) -> Value {
    let mut out = serde_json::Map::new();
    for key in ATTRIBUTE_ALLOWLIST {
        if let Some(value) = attributes.get(*key) {
            if let Ok(v) = serde_json::to_value(value) {
                out.insert(key.to_string(), v);
            }
        }
    }
    Value::Object(out)
}

fn spans_to_trajectory(spans: &[SpanRecord]) -> Vec<Value> {
    let mut sorted: Vec<&SpanRecord> = spans.iter().collect();
    sorted.sort_by(|a, b| {
        (a.start_time, a.end_time, &a.span_id).cmp(&(b.start_time, b.end_time, &b.span_id))
    });

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, span)| {
            let start_ms = span.start_time.timestamp_millis();
            let end_ms = span.end_time.timestamp_millis();
            json!({
                "step": i + 1,
                "span_id": span.span_id,
                "parent_span_id": span.parent_span_id,
                "name": if span.name.is_empty() { "unnamed-span".to_string() } else { span.name.clone() },
                "start_time_ms": start_ms,
                "end_time_ms": end_ms,
                "latency_ms": (end_ms - start_ms).max(0),
                "status": span.status,
                "attributes": pruned_attributes(&span.attributes),
                "events": span.events.iter().map(|e| json!({
                    "name": e.name,
                    "time_ms": e.time.timestamp_millis(),
                    "attributes": pruned_attributes(&e.attributes),
                })).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn logs_to_trajectory(logs: &[LogRecord]) -> Vec<Value> {
    let mut sorted: Vec<&LogRecord> = logs.iter().collect();
    sorted.sort_by(|a, b| {
        (a.event_time, &a.trace_id, &a.span_id).cmp(&(b.event_time, &b.trace_id, &b.span_id))
    });

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, log)| {
            let ms = log.event_time.timestamp_millis();
            json!({
                "step": i + 1,
                "span_id": log.span_id,
                "parent_span_id": Value::Null,
                "name": "unnamed-span",
                "start_time_ms": ms,
                "end_time_ms": ms,
                "latency_ms": 0,
                "status": "unset",
                "attributes": pruned_attributes(&log.attributes),
                "events": vec![json!({
                    "name": "log",
                    "time_ms": ms,
                    "attributes": {
                        "body": log.body_text,
                        "severity_text": log.severity_text,
                        "service.name": log.service_name,
                    },
                })],
            })
        })
        .collect()
}

/// Timestamp-shaped fields on an agent-self-reported trajectory step. Unlike
/// OTLP spans and logs, these steps are arbitrary JSON the agent wrote to its
/// own stdout, so a `start_time`/`end_time`/`time` value may be a unix epoch
/// of unknown unit, or an ISO-8601 string with or without a zone suffix.
const STEP_TIMESTAMP_KEYS: &[&str] = &["start_time", "end_time", "time", "timestamp"];

/// Normalizes the timestamp-shaped fields of agent-self-reported trajectory
/// steps in place, leaving everything else untouched. Steps resolved from
/// OTLP spans or logs never pass through here since their timestamps are
/// already typed `DateTime<Utc>` by the time [`spans_to_trajectory`] or
/// [`logs_to_trajectory`] run.
pub fn normalize_agent_trajectory(mut steps: Vec<Value>) -> Vec<Value> {
    for step in &mut steps {
        let Some(obj) = step.as_object_mut() else { continue };
        for key in STEP_TIMESTAMP_KEYS {
            if let Some(value) = obj.get_mut(*key) {
                normalize_timestamp_value(value);
            }
        }
    }
    steps
}

fn normalize_timestamp_value(value: &mut Value) {
    match value {
        Value::Number(n) => {
            if let Some(raw) = n.as_i64() {
                *value = json!(epoch_to_millis(raw));
            }
        }
        Value::String(s) => {
            *s = normalize_iso_timestamp(s);
        }
        _ => {}
    }
}

/// Converts a raw epoch value of unknown unit using the documented heuristic:
/// values above 1e12 are nanoseconds, above 1e9 are seconds, else milliseconds.
fn epoch_to_millis(raw: i64) -> i64 {
    if raw > 1_000_000_000_000 {
        raw / 1_000_000
    } else if raw > 1_000_000_000 {
        raw * 1000
    } else {
        raw
    }
}

/// Normalizes a `Z`-suffixed ISO-8601 timestamp to an explicit UTC offset so
/// `chrono::DateTime::parse_from_rfc3339` accepts it uniformly.
fn normalize_iso_timestamp(raw: &str) -> String {
    if let Some(stripped) = raw.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_heuristic_classifies_nanos_seconds_and_millis() {
        assert_eq!(epoch_to_millis(1_700_000_000_000_000_000), 1_700_000_000_000);
        assert_eq!(epoch_to_millis(1_700_000_000), 1_700_000_000_000);
        assert_eq!(epoch_to_millis(1_700_000_000_000), 1_700_000_000_000);
    }

    #[test]
    fn normalize_iso_timestamp_replaces_zulu_suffix() {
        assert_eq!(normalize_iso_timestamp("2026-08-01T00:00:00Z"), "2026-08-01T00:00:00+00:00");
        assert_eq!(normalize_iso_timestamp("2026-08-01T00:00:00+02:00"), "2026-08-01T00:00:00+02:00");
    }

    #[test]
    fn normalize_agent_trajectory_fixes_epoch_units_and_zulu_suffix() {
        let steps = vec![
            json!({"start_time": 1_700_000_000_000_000_000i64, "end_time": "2026-08-01T00:00:00Z"}),
            json!({"start_time": 1_700_000_000, "note": "unaffected"}),
        ];
        let normalized = normalize_agent_trajectory(steps);
        assert_eq!(normalized[0]["start_time"], json!(1_700_000_000_000i64));
        assert_eq!(normalized[0]["end_time"], json!("2026-08-01T00:00:00+00:00"));
        assert_eq!(normalized[1]["start_time"], json!(1_700_000_000_000i64));
        assert_eq!(normalized[1]["note"], json!("unaffected"));
    }

    #[test]
    fn spans_to_trajectory_sorts_and_numbers_steps() {
        let mut later = sample_span("b");
        later.start_time = chrono::DateTime::from_timestamp_millis(2000).unwrap();
        later.end_time = chrono::DateTime::from_timestamp_millis(2500).unwrap();
        let mut earlier = sample_span("a");
        earlier.start_time = chrono::DateTime::from_timestamp_millis(1000).unwrap();
        earlier.end_time = chrono::DateTime::from_timestamp_millis(1200).unwrap();

        let trajectory = spans_to_trajectory(&[later, earlier]);
        assert_eq!(trajectory[0]["span_id"], "a");
        assert_eq!(trajectory[0]["step"], 1);
        assert_eq!(trajectory[1]["span_id"], "b");
        assert_eq!(trajectory[1]["latency_ms"], 500);
    }

    fn sample_span(span_id: &str) -> SpanRecord {
        SpanRecord {
            trace_id: "t".into(),
            span_id: span_id.into(),
            parent_span_id: None,
            name: String::new(),
            service_name: "agent".into(),
            attributes: Default::default(),
            resource_attributes: Default::default(),
            scope: Default::default(),
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
            status: crate::domain::otel::SpanStatus::Unset,
            events: vec![],
            benchmark_run_case_id: None,
            benchmark_experiment_id: None,
        }
    }
}
