//! In-process OTLP ingestion endpoint and the in-memory span/log index
//! [`crate::trajectory::TrajectoryResolver`] reads first, before falling
//! back to the repository.

mod json_otlp;
pub mod normalize;
mod server;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OtelSettings;
use crate::domain::otel::{LogRecord, SpanRecord};
use crate::repository::Repository;

#[derive(Default)]
struct Index {
    spans: Vec<SpanRecord>,
    logs: Vec<LogRecord>,
}

pub struct OtlpCollector {
    settings: OtelSettings,
    repository: Arc<dyn Repository>,
    index: Mutex<Index>,
}

/// Handle to the bound HTTP server; dropping it does not stop the server —
/// call [`OtlpCollectorHandle::shutdown`] or let the process exit.
pub struct OtlpCollectorHandle {
    join: JoinHandle<()>,
}

impl OtlpCollectorHandle {
    pub fn abort(&self) {
        self.join.abort();
    }
}

impl OtlpCollector {
    pub fn new(settings: OtelSettings, repository: Arc<dyn Repository>) -> Arc<Self> {
        Arc::new(Self { settings, repository, index: Mutex::new(Index::default()) })
    }

    /// Binds the configured host/port and serves until aborted. Returns `None`
    /// (rather than erroring) on `EADDRINUSE`, per the documented soft-fail:
    /// the worker continues with DB-only trajectory resolution.
    pub async fn start(self: Arc<Self>) -> Option<OtlpCollectorHandle> {
        if !self.settings.collector_enabled {
            return None;
        }
        let addr = format!("{}:{}", self.settings.collector_host, self.settings.collector_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(code = "E_OTEL_COLLECTOR_PORT_IN_USE", addr, "collector disabled, falling back to DB-only trajectory");
                return None;
            }
            Err(e) => {
                warn!(code = "E_OTEL_COLLECTOR_PORT_IN_USE", addr, error = %e, "failed to bind collector");
                return None;
            }
        };
        info!(addr, path = %self.settings.collector_path, "otlp collector listening");

        let router = server::router(self.clone());
        let join = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "otlp collector server exited");
            }
        });
        Some(OtlpCollectorHandle { join })
    }

    async fn ingest_spans(&self, spans: Vec<SpanRecord>) {
        if spans.is_empty() {
            return;
        }
        if let Err(e) = self.repository.persist_spans(&spans).await {
            warn!(error = %e, "failed to persist spans");
        }
        self.index.lock().await.spans.extend(spans);
    }

    async fn ingest_logs(&self, logs: Vec<LogRecord>) {
        if logs.is_empty() {
            return;
        }
        if let Err(e) = self.repository.persist_logs(&logs).await {
            warn!(error = %e, "failed to persist logs");
        }
        self.index.lock().await.logs.extend(logs);
    }

    /// Spans for `run_case_id` within `[start_ms - 60s, end_ms + 60s]`, from
    /// the in-memory index only — the repository fallback lives in
    /// [`crate::trajectory`].
    pub async fn indexed_spans(&self, run_case_id: &str, start_ms: i64, end_ms: i64) -> Vec<SpanRecord> {
        let window_start = start_ms - 60_000;
        let window_end = end_ms + 60_000;
        let index = self.index.lock().await;
        index
            .spans
            .iter()
            .filter(|s| s.benchmark_run_case_id.as_deref() == Some(run_case_id))
            .filter(|s| {
                let ms = s.start_time.timestamp_millis();
                ms >= window_start && ms <= window_end
            })
            .cloned()
            .collect()
    }

    pub async fn indexed_logs(&self, run_case_id: &str, start_ms: i64, end_ms: i64) -> Vec<LogRecord> {
        let window_start = start_ms - 60_000;
        let window_end = end_ms + 60_000;
        let index = self.index.lock().await;
        index
            .logs
            .iter()
            .filter(|l| l.benchmark_run_case_id.as_deref() == Some(run_case_id))
            .filter(|l| {
                let ms = l.event_time.timestamp_millis();
                ms >= window_start && ms <= window_end
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{ExperimentQueueState, RuntimeSnapshot};
    use crate::domain::{CaseResult, CaseStatus};
    use async_trait::async_trait;

    struct NullRepository;

    #[async_trait]
    impl Repository for NullRepository {
        async fn get_experiment_queue_state(&self, _experiment_id: &str) -> anyhow::Result<ExperimentQueueState> {
            Ok(ExperimentQueueState::default())
        }
        async fn mark_cases_queued(&self, _experiment_id: &str, _run_case_ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_case_status(&self, _experiment_id: &str, _run_case_id: &str, _status: CaseStatus) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn persist_case_result(&self, _experiment_id: &str, _run_case_id: &str, _result: &CaseResult, _runtime_snapshot: &RuntimeSnapshot) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch_spans_by_run_case(&self, _run_case_id: &str, _start_ms: i64, _end_ms: i64, _limit: i64) -> anyhow::Result<Vec<SpanRecord>> {
            Ok(vec![])
        }
        async fn fetch_logs_by_run_case(&self, _run_case_id: &str, _start_ms: i64, _end_ms: i64, _limit: i64) -> anyhow::Result<Vec<LogRecord>> {
            Ok(vec![])
        }
        async fn persist_spans(&self, _spans: &[SpanRecord]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn persist_logs(&self, _logs: &[LogRecord]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn sample_settings() -> OtelSettings {
        OtelSettings {
            enabled: true,
            endpoint: None,
            query_timeout_seconds: 10,
            protocol: "http/protobuf".into(),
            collector_enabled: true,
            collector_host: "127.0.0.1".into(),
            collector_port: 0,
            collector_path: "/v1/traces".into(),
            public_endpoint: None,
        }
    }

    #[tokio::test]
    async fn ingested_spans_are_queryable_by_run_case_and_window() {
        let collector = OtlpCollector::new(sample_settings(), Arc::new(NullRepository));
        let mut span = sample_span("case-1");
        span.start_time = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        collector.ingest_spans(vec![span]).await;

        let found = collector.indexed_spans("case-1", 1_700_000_000_000, 1_700_000_000_000).await;
        assert_eq!(found.len(), 1);

        let missed = collector.indexed_spans("case-2", 1_700_000_000_000, 1_700_000_000_000).await;
        assert!(missed.is_empty());
    }

    fn sample_span(run_case_id: &str) -> SpanRecord {
        SpanRecord {
            trace_id: "t".into(),
            span_id: "s".into(),
            parent_span_id: None,
            name: "step".into(),
            service_name: "agent".into(),
            attributes: Default::default(),
            resource_attributes: Default::default(),
            scope: Default::default(),
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
            status: crate::domain::otel::SpanStatus::Unset,
            events: vec![],
            benchmark_run_case_id: Some(run_case_id.to_string()),
            benchmark_experiment_id: None,
        }
    }
}
