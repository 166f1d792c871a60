//! A narrow `serde` mirror of the OTLP JSON encoding (camelCase field names,
//! base64 trace/span ids, `timeUnixNano` rendered as a decimal string since
//! JSON numbers cannot hold a full `uint64`). Used only for the JSON fallback
//! branch of ingestion; the protobuf branch decodes straight into the
//! upstream `opentelemetry-proto` generated types.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::otel::{AttributeValue, Attributes, LogRecord, Scope, SpanEvent, SpanRecord, SpanStatus, lift_benchmark_ids, service_name_or_default};

fn decode_id(raw: &str) -> String {
    BASE64
        .decode(raw)
        .map(hex::encode)
        .unwrap_or_else(|_| raw.to_string())
}

fn nanos_to_datetime(raw: &str) -> DateTime<Utc> {
    let nanos: u64 = raw.parse().unwrap_or(0);
    DateTime::from_timestamp((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32)
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonAnyValue {
    StringValue { #[serde(rename = "stringValue")] string_value: String },
    IntValue { #[serde(rename = "intValue")] int_value: String },
    DoubleValue { #[serde(rename = "doubleValue")] double_value: f64 },
    BoolValue { #[serde(rename = "boolValue")] bool_value: bool },
    ArrayValue { #[serde(rename = "arrayValue")] array_value: JsonArrayValue },
    KvlistValue { #[serde(rename = "kvlistValue")] kvlist_value: JsonKvList },
}

#[derive(Debug, Deserialize)]
struct JsonArrayValue {
    #[serde(default)]
    values: Vec<JsonAnyValue>,
}

#[derive(Debug, Deserialize)]
struct JsonKvList {
    #[serde(default)]
    values: Vec<JsonKeyValue>,
}

#[derive(Debug, Deserialize)]
struct JsonKeyValue {
    key: String,
    value: JsonAnyValue,
}

impl From<&JsonAnyValue> for AttributeValue {
    fn from(value: &JsonAnyValue) -> Self {
        match value {
            JsonAnyValue::StringValue { string_value } => AttributeValue::String(string_value.clone()),
            JsonAnyValue::IntValue { int_value } => {
                AttributeValue::Int(int_value.parse().unwrap_or(0))
            }
            JsonAnyValue::DoubleValue { double_value } => AttributeValue::Double(*double_value),
            JsonAnyValue::BoolValue { bool_value } => AttributeValue::Bool(*bool_value),
            JsonAnyValue::ArrayValue { array_value } => {
                AttributeValue::Array(array_value.values.iter().map(AttributeValue::from).collect())
            }
            JsonAnyValue::KvlistValue { kvlist_value } => {
                AttributeValue::Map(kv_list_to_attributes(kvlist_value))
            }
        }
    }
}

fn kv_list_to_attributes(list: &JsonKvList) -> Attributes {
    list.values.iter().map(|kv| (kv.key.clone(), AttributeValue::from(&kv.value))).collect()
}

#[derive(Debug, Default, Deserialize)]
struct JsonResource {
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct JsonScope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Deserialize)]
struct JsonSpanEvent {
    #[serde(default)]
    name: String,
    #[serde(rename = "timeUnixNano", default)]
    time_unix_nano: String,
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
}

#[derive(Debug, Deserialize)]
struct JsonSpanStatus {
    #[serde(default)]
    code: i32,
}

#[derive(Debug, Deserialize)]
struct JsonSpan {
    #[serde(rename = "traceId")]
    trace_id: String,
    #[serde(rename = "spanId")]
    span_id: String,
    #[serde(rename = "parentSpanId", default)]
    parent_span_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
    #[serde(rename = "startTimeUnixNano", default)]
    start_time_unix_nano: String,
    #[serde(rename = "endTimeUnixNano", default)]
    end_time_unix_nano: String,
    #[serde(default)]
    status: Option<JsonSpanStatus>,
    #[serde(default)]
    events: Vec<JsonSpanEvent>,
}

#[derive(Debug, Deserialize)]
struct JsonScopeSpans {
    #[serde(default)]
    scope: Option<JsonScope>,
    #[serde(default)]
    spans: Vec<JsonSpan>,
}

#[derive(Debug, Deserialize)]
struct JsonResourceSpans {
    #[serde(default)]
    resource: Option<JsonResource>,
    #[serde(rename = "scopeSpans", default)]
    scope_spans: Vec<JsonScopeSpans>,
}

#[derive(Debug, Deserialize)]
pub struct JsonTraceRequest {
    #[serde(rename = "resourceSpans", default)]
    resource_spans: Vec<JsonResourceSpans>,
}

impl JsonTraceRequest {
    pub fn into_spans(self) -> Vec<SpanRecord> {
        let mut out = Vec::new();
        for resource_spans in self.resource_spans {
            let resource_attributes = resource_spans
                .resource
                .map(|r| kv_list_to_attributes(&JsonKvList { values: r.attributes }))
                .unwrap_or_default();

            for scope_spans in resource_spans.scope_spans {
                let scope_json = scope_spans.scope.unwrap_or_default();
                let scope = Scope {
                    name: scope_json.name.clone(),
                    version: scope_json.version.clone(),
                    attributes: kv_list_to_attributes(&JsonKvList { values: scope_json.attributes }),
                };

                for span in scope_spans.spans {
                    let mut attributes = kv_list_to_attributes(&JsonKvList { values: span.attributes });
                    let service_name = service_name_or_default(&attributes);
                    attributes
                        .entry("service.name".to_string())
                        .or_insert_with(|| AttributeValue::String(service_name.clone()));

                    let (benchmark_run_case_id, benchmark_experiment_id) =
                        lift_benchmark_ids(&attributes, &resource_attributes);

                    let events = span
                        .events
                        .into_iter()
                        .map(|event| SpanEvent {
                            name: event.name,
                            time: nanos_to_datetime(&event.time_unix_nano),
                            attributes: kv_list_to_attributes(&JsonKvList { values: event.attributes }),
                        })
                        .collect();

                    let status = match span.status.map(|s| s.code) {
                        Some(2) => SpanStatus::Error,
                        Some(1) => SpanStatus::Ok,
                        _ => SpanStatus::Unset,
                    };

                    out.push(SpanRecord {
                        trace_id: decode_id(&span.trace_id),
                        span_id: decode_id(&span.span_id),
                        parent_span_id: (!span.parent_span_id.is_empty()).then(|| decode_id(&span.parent_span_id)),
                        name: span.name,
                        service_name,
                        attributes,
                        resource_attributes: resource_attributes.clone(),
                        scope: scope.clone(),
                        start_time: nanos_to_datetime(&span.start_time_unix_nano),
                        end_time: nanos_to_datetime(&span.end_time_unix_nano),
                        status,
                        events,
                        benchmark_run_case_id,
                        benchmark_experiment_id,
                    });
                }
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct JsonLogRecord {
    #[serde(rename = "traceId", default)]
    trace_id: String,
    #[serde(rename = "spanId", default)]
    span_id: String,
    #[serde(default)]
    attributes: Vec<JsonKeyValue>,
    #[serde(rename = "severityText", default)]
    severity_text: String,
    #[serde(rename = "severityNumber", default)]
    severity_number: i32,
    #[serde(default)]
    body: Option<JsonAnyValue>,
    #[serde(rename = "timeUnixNano", default)]
    time_unix_nano: String,
    #[serde(rename = "observedTimeUnixNano", default)]
    observed_time_unix_nano: String,
}

#[derive(Debug, Deserialize)]
struct JsonScopeLogs {
    #[serde(default)]
    scope: Option<JsonScope>,
    #[serde(rename = "logRecords", default)]
    log_records: Vec<JsonLogRecord>,
}

#[derive(Debug, Deserialize)]
struct JsonResourceLogs {
    #[serde(default)]
    resource: Option<JsonResource>,
    #[serde(rename = "scopeLogs", default)]
    scope_logs: Vec<JsonScopeLogs>,
}

#[derive(Debug, Deserialize)]
pub struct JsonLogsRequest {
    #[serde(rename = "resourceLogs", default)]
    resource_logs: Vec<JsonResourceLogs>,
}

impl JsonLogsRequest {
    pub fn into_logs(self) -> Vec<LogRecord> {
        let mut out = Vec::new();
        for resource_logs in self.resource_logs {
            let resource_attributes = resource_logs
                .resource
                .map(|r| kv_list_to_attributes(&JsonKvList { values: r.attributes }))
                .unwrap_or_default();

            for scope_logs in resource_logs.scope_logs {
                let scope_json = scope_logs.scope.unwrap_or_default();
                let scope = Scope {
                    name: scope_json.name.clone(),
                    version: scope_json.version.clone(),
                    attributes: kv_list_to_attributes(&JsonKvList { values: scope_json.attributes }),
                };

                for record in scope_logs.log_records {
                    let mut attributes = kv_list_to_attributes(&JsonKvList { values: record.attributes });
                    let service_name = service_name_or_default(&attributes);
                    attributes
                        .entry("service.name".to_string())
                        .or_insert_with(|| AttributeValue::String(service_name.clone()));

                    let (benchmark_run_case_id, benchmark_experiment_id) =
                        lift_benchmark_ids(&attributes, &resource_attributes);

                    let (body_text, body_json) = match &record.body {
                        Some(JsonAnyValue::StringValue { string_value }) => (Some(string_value.clone()), None),
                        Some(other) => {
                            let value = AttributeValue::from(other);
                            (None, serde_json::to_value(&value).ok())
                        }
                        None => (None, None),
                    };

                    out.push(LogRecord {
                        trace_id: (!record.trace_id.is_empty()).then(|| decode_id(&record.trace_id)),
                        span_id: (!record.span_id.is_empty()).then(|| decode_id(&record.span_id)),
                        service_name,
                        attributes,
                        resource_attributes: resource_attributes.clone(),
                        scope: scope.clone(),
                        severity_text: (!record.severity_text.is_empty()).then(|| record.severity_text),
                        severity_number: (record.severity_number != 0).then_some(record.severity_number),
                        body_text,
                        body_json,
                        event_time: nanos_to_datetime(&record.time_unix_nano),
                        observed_time: nanos_to_datetime(&record.observed_time_unix_nano),
                        benchmark_run_case_id,
                        benchmark_experiment_id,
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_id_falls_back_to_raw_on_bad_base64() {
        assert_eq!(decode_id("not base64!!"), "not base64!!");
    }

    #[test]
    fn parses_minimal_trace_json() {
        let payload = serde_json::json!({
            "resourceSpans": [{
                "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "agent"}}]},
                "scopeSpans": [{
                    "scope": {"name": "agent-tracer"},
                    "spans": [{
                        "traceId": base64::engine::general_purpose::STANDARD.encode([1u8; 16]),
                        "spanId": base64::engine::general_purpose::STANDARD.encode([2u8; 8]),
                        "name": "tool_call",
                        "startTimeUnixNano": "1700000000000000000",
                        "endTimeUnixNano": "1700000001000000000",
                        "attributes": [{"key": "benchmark.run_case_id", "value": {"stringValue": "case-1"}}]
                    }]
                }]
            }]
        });
        let request: JsonTraceRequest = serde_json::from_value(payload).unwrap();
        let spans = request.into_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "tool_call");
        assert_eq!(spans[0].benchmark_run_case_id.as_deref(), Some("case-1"));
        assert_eq!(spans[0].service_name, "agent");
    }
}
