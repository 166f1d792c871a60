//! Normalized OTLP span/log records.
//!
//! Attributes are modeled as a tagged variant rather than raw `serde_json::Value`
//! so that both camelCase and snake_case OTLP key spellings, and the OTLP
//! `AnyValue` union, collapse into one representation before anything downstream
//! (trajectory mapping, typed-column extraction) has to look at them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVICE_NAME: &str = "benchmark-agent";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(Vec<AttributeValue>),
    Map(HashMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

pub type Attributes = HashMap<String, AttributeValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Scope {
    pub name: Option<String>,
    pub version: Option<String>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub service_name: String,
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub scope: Scope,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,
    pub events: Vec<SpanEvent>,
    /// Lifted from `attributes["benchmark.run_case_id"]` / resource attributes when present.
    pub benchmark_run_case_id: Option<String>,
    pub benchmark_experiment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogRecord {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub service_name: String,
    pub attributes: Attributes,
    pub resource_attributes: Attributes,
    pub scope: Scope,
    pub severity_text: Option<String>,
    pub severity_number: Option<i32>,
    pub body_text: Option<String>,
    pub body_json: Option<serde_json::Value>,
    pub event_time: DateTime<Utc>,
    pub observed_time: DateTime<Utc>,
    pub benchmark_run_case_id: Option<String>,
    pub benchmark_experiment_id: Option<String>,
}

/// Extracts `benchmark.run_case_id` / `benchmark.experiment_id`, checking
/// `attributes` before `resource_attributes` (attributes take precedence — an
/// agent-set span attribute should not be shadowed by a resource-level default).
pub fn lift_benchmark_ids(
    attributes: &Attributes,
    resource_attributes: &Attributes,
) -> (Option<String>, Option<String>) {
    let lookup = |key: &str| -> Option<String> {
        attributes
            .get(key)
            .or_else(|| resource_attributes.get(key))
            .and_then(AttributeValue::as_str)
            .map(str::to_string)
    };
    (lookup("benchmark.run_case_id"), lookup("benchmark.experiment_id"))
}

pub fn service_name_or_default(attributes: &Attributes) -> String {
    attributes
        .get("service.name")
        .and_then(AttributeValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lift_benchmark_ids_prefers_attributes_over_resource() {
        let mut attrs = Attributes::new();
        attrs.insert(
            "benchmark.run_case_id".into(),
            AttributeValue::String("case-a".into()),
        );
        let mut resource = Attributes::new();
        resource.insert(
            "benchmark.run_case_id".into(),
            AttributeValue::String("case-b".into()),
        );
        let (run_case_id, _) = lift_benchmark_ids(&attrs, &resource);
        assert_eq!(run_case_id.as_deref(), Some("case-a"));
    }

    #[test]
    fn lift_benchmark_ids_falls_back_to_resource() {
        let attrs = Attributes::new();
        let mut resource = Attributes::new();
        resource.insert(
            "benchmark.experiment_id".into(),
            AttributeValue::String("exp-1".into()),
        );
        let (_, experiment_id) = lift_benchmark_ids(&attrs, &resource);
        assert_eq!(experiment_id.as_deref(), Some("exp-1"));
    }

    #[test]
    fn service_name_defaults_when_absent() {
        assert_eq!(service_name_or_default(&Attributes::new()), DEFAULT_SERVICE_NAME);
    }
}
