//! The axum HTTP surface the sandboxed agent's OTLP exporter talks to.

use std::sync::Arc;

use axum::Router;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use serde_json::json;
use tracing::warn;

use super::OtlpCollector;
use super::json_otlp::{JsonLogsRequest, JsonTraceRequest};
use super::normalize::{
    decode_logs_protobuf, decode_trace_protobuf, is_protobuf_content_type, maybe_gunzip,
    normalize_log_request, normalize_trace_request,
};

pub fn router(collector: Arc<OtlpCollector>) -> Router {
    let traces_path = collector.settings.collector_path.clone();
    let logs_path = collector.settings.logs_path();
    let metrics_path = collector.settings.metrics_path();

    Router::new()
        .route(&traces_path, post(ingest_traces))
        .route(&logs_path, post(ingest_logs))
        .route(&metrics_path, post(ingest_metrics))
        .with_state(collector)
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string()
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn invalid_json() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"ok": false, "error": "invalid_json"})))
}

async fn ingest_traces(
    State(collector): State<Arc<OtlpCollector>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let content_type = content_type(&headers);
    let body = match maybe_gunzip(&body, content_encoding(&headers).as_deref()) {
        Ok(body) => body,
        Err(e) => {
            warn!(code = "E_OTLP_DECODE", error = %e, "gzip decode failed");
            return invalid_json();
        }
    };

    let spans = if is_protobuf_content_type(&content_type) {
        match decode_trace_protobuf(&body) {
            Ok(request) => normalize_trace_request(&request),
            Err(_) => return invalid_json(),
        }
    } else {
        match serde_json::from_slice::<JsonTraceRequest>(&body) {
            Ok(request) => request.into_spans(),
            Err(_) => return invalid_json(),
        }
    };

    let inserted = spans.len();
    collector.ingest_spans(spans).await;
    (StatusCode::OK, Json(json!({"ok": true, "inserted": inserted})))
}

async fn ingest_logs(
    State(collector): State<Arc<OtlpCollector>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let content_type = content_type(&headers);
    let body = match maybe_gunzip(&body, content_encoding(&headers).as_deref()) {
        Ok(body) => body,
        Err(_) => return invalid_json(),
    };

    let logs = if is_protobuf_content_type(&content_type) {
        match decode_logs_protobuf(&body) {
            Ok(request) => normalize_log_request(&request),
            Err(_) => return invalid_json(),
        }
    } else {
        match serde_json::from_slice::<JsonLogsRequest>(&body) {
            Ok(request) => request.into_logs(),
            Err(_) => return invalid_json(),
        }
    };

    let inserted = logs.len();
    collector.ingest_logs(logs).await;
    (StatusCode::OK, Json(json!({"ok": true, "inserted": inserted})))
}

/// Metrics are accepted and discarded; this worker never reads them back.
async fn ingest_metrics() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"ok": true, "inserted": 0})))
}
