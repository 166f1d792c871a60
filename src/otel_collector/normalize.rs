//! Decodes OTLP trace/log export requests (JSON or protobuf, optionally
//! gzipped) into [`SpanRecord`]/[`LogRecord`] values.

use std::io::Read;

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value::Value as OtlpValue};
use prost::Message as ProstMessage;

use crate::domain::otel::{
    Attributes, LogRecord, Scope, SpanEvent, SpanRecord, SpanStatus, lift_benchmark_ids,
    service_name_or_default,
};
use crate::error::{WorkerError, WorkerResult};

/// `Content-Type` header values accepted as protobuf-encoded OTLP. Collectors
/// in the wild emit either spelling; both decode identically.
pub fn is_protobuf_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    base == "application/x-protobuf" || base == "application/protobuf"
}

pub fn maybe_gunzip(body: &[u8], content_encoding: Option<&str>) -> WorkerResult<Vec<u8>> {
    if content_encoding.map(|v| v.eq_ignore_ascii_case("gzip")).unwrap_or(false) {
        let mut decoder = flate2::read::GzDecoder::new(body);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("gzip decode failed: {e}")))?;
        Ok(out)
    } else {
        Ok(body.to_vec())
    }
}

fn any_value_to_attribute(value: &AnyValue) -> crate::domain::otel::AttributeValue {
    use crate::domain::otel::AttributeValue as A;
    match &value.value {
        Some(OtlpValue::StringValue(s)) => A::String(s.clone()),
        Some(OtlpValue::IntValue(i)) => A::Int(*i),
        Some(OtlpValue::DoubleValue(d)) => A::Double(*d),
        Some(OtlpValue::BoolValue(b)) => A::Bool(*b),
        Some(OtlpValue::BytesValue(b)) => A::Bytes(b.clone()),
        Some(OtlpValue::ArrayValue(arr)) => {
            A::Array(arr.values.iter().map(any_value_to_attribute).collect())
        }
        Some(OtlpValue::KvlistValue(kv)) => A::Map(key_values_to_attributes(&kv.values)),
        None => A::String(String::new()),
    }
}

fn key_values_to_attributes(pairs: &[KeyValue]) -> Attributes {
    pairs
        .iter()
        .filter_map(|kv| kv.value.as_ref().map(|v| (kv.key.clone(), any_value_to_attribute(v))))
        .collect()
}

fn unix_nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(
        (nanos / 1_000_000_000) as i64,
        (nanos % 1_000_000_000) as u32,
    )
    .unwrap_or_else(Utc::now)
}

/// Normalizes a decoded `ExportTraceServiceRequest` into span records,
/// lifting `benchmark.*` ids and defaulting `service.name`.
pub fn normalize_trace_request(request: &ExportTraceServiceRequest) -> Vec<SpanRecord> {
    let mut out = Vec::new();
    for resource_spans in &request.resource_spans {
        let resource_attributes = resource_spans
            .resource
            .as_ref()
            .map(|r| key_values_to_attributes(&r.attributes))
            .unwrap_or_default();

        for scope_spans in &resource_spans.scope_spans {
            let scope = Scope {
                name: scope_spans.scope.as_ref().map(|s| s.name.clone()),
                version: scope_spans.scope.as_ref().map(|s| s.version.clone()),
                attributes: scope_spans
                    .scope
                    .as_ref()
                    .map(|s| key_values_to_attributes(&s.attributes))
                    .unwrap_or_default(),
            };

            for span in &scope_spans.spans {
                let mut attributes = key_values_to_attributes(&span.attributes);
                let service_name = service_name_or_default(&attributes);
                attributes
                    .entry("service.name".to_string())
                    .or_insert_with(|| crate::domain::otel::AttributeValue::String(service_name.clone()));

                let (benchmark_run_case_id, benchmark_experiment_id) =
                    lift_benchmark_ids(&attributes, &resource_attributes);

                let events = span
                    .events
                    .iter()
                    .map(|event| SpanEvent {
                        name: event.name.clone(),
                        time: unix_nanos_to_datetime(event.time_unix_nano),
                        attributes: key_values_to_attributes(&event.attributes),
                    })
                    .collect();

                let status = match span.status.as_ref().map(|s| s.code) {
                    Some(2) => SpanStatus::Error,
                    Some(1) => SpanStatus::Ok,
                    _ => SpanStatus::Unset,
                };

                out.push(SpanRecord {
                    trace_id: hex::encode(&span.trace_id),
                    span_id: hex::encode(&span.span_id),
                    parent_span_id: (!span.parent_span_id.is_empty())
                        .then(|| hex::encode(&span.parent_span_id)),
                    name: span.name.clone(),
                    service_name,
                    attributes,
                    resource_attributes: resource_attributes.clone(),
                    scope: scope.clone(),
                    start_time: unix_nanos_to_datetime(span.start_time_unix_nano),
                    end_time: unix_nanos_to_datetime(span.end_time_unix_nano),
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

pub fn normalize_log_request(request: &ExportLogsServiceRequest) -> Vec<LogRecord> {
    let mut out = Vec::new();
    for resource_logs in &request.resource_logs {
        let resource_attributes = resource_logs
            .resource
            .as_ref()
            .map(|r| key_values_to_attributes(&r.attributes))
            .unwrap_or_default();

        for scope_logs in &resource_logs.scope_logs {
            let scope = Scope {
                name: scope_logs.scope.as_ref().map(|s| s.name.clone()),
                version: scope_logs.scope.as_ref().map(|s| s.version.clone()),
                attributes: scope_logs
                    .scope
                    .as_ref()
                    .map(|s| key_values_to_attributes(&s.attributes))
                    .unwrap_or_default(),
            };

            for record in &scope_logs.log_records {
                let mut attributes = key_values_to_attributes(&record.attributes);
                let service_name = service_name_or_default(&attributes);
                attributes
                    .entry("service.name".to_string())
                    .or_insert_with(|| crate::domain::otel::AttributeValue::String(service_name.clone()));

                let (benchmark_run_case_id, benchmark_experiment_id) =
                    lift_benchmark_ids(&attributes, &resource_attributes);

                let (body_text, body_json) = match record.body.as_ref().and_then(|b| b.value.as_ref()) {
                    Some(OtlpValue::StringValue(s)) => (Some(s.clone()), None),
                    Some(other) => {
                        let value = any_value_to_attribute(&AnyValue { value: Some(other.clone()) });
                        (None, serde_json::to_value(&value).ok())
                    }
                    None => (None, None),
                };

                out.push(LogRecord {
                    trace_id: (!record.trace_id.is_empty()).then(|| hex::encode(&record.trace_id)),
                    span_id: (!record.span_id.is_empty()).then(|| hex::encode(&record.span_id)),
                    service_name,
                    attributes,
                    resource_attributes: resource_attributes.clone(),
                    scope: scope.clone(),
                    severity_text: (!record.severity_text.is_empty()).then(|| record.severity_text.clone()),
                    severity_number: (record.severity_number != 0).then_some(record.severity_number),
                    body_text,
                    body_json,
                    event_time: unix_nanos_to_datetime(record.time_unix_nano),
                    observed_time: unix_nanos_to_datetime(record.observed_time_unix_nano),
                    benchmark_run_case_id,
                    benchmark_experiment_id,
                });
            }
        }
    }
    out
}

pub fn decode_trace_protobuf(body: &[u8]) -> WorkerResult<ExportTraceServiceRequest> {
    ExportTraceServiceRequest::decode(body)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("invalid trace protobuf: {e}")))
}

pub fn decode_logs_protobuf(body: &[u8]) -> WorkerResult<ExportLogsServiceRequest> {
    ExportLogsServiceRequest::decode(body)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("invalid logs protobuf: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protobuf_content_type_accepts_both_spellings() {
        assert!(is_protobuf_content_type("application/x-protobuf"));
        assert!(is_protobuf_content_type("application/protobuf; charset=utf-8"));
        assert!(!is_protobuf_content_type("application/json"));
    }

    #[test]
    fn gunzip_passes_through_when_not_gzip_encoded() {
        let body = b"plain body".to_vec();
        let out = maybe_gunzip(&body, None).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn unix_nanos_converts_to_expected_second() {
        let dt = unix_nanos_to_datetime(1_700_000_000_000_000_000);
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }
}
