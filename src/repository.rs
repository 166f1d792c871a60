//! The abstract persistent store. No SQL leaks past this module boundary:
//! callers see named, transactional operations only.

pub mod postgres;

use async_trait::async_trait;

use crate::domain::{CaseResult, CaseStatus, LogRecord, SpanRecord};

pub use postgres::PostgresRepository;

#[derive(Debug, Clone, Default)]
pub struct ExperimentQueueState {
    pub queue_status: Option<String>,
    pub queue_message_id: Option<String>,
}

/// A runtime-spec snapshot persisted alongside a case result, for audit/debugging.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeSnapshot {
    pub agent_image: String,
    pub pull_policy: String,
    pub docker_network: Option<String>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_experiment_queue_state(&self, experiment_id: &str) -> anyhow::Result<ExperimentQueueState>;

    async fn mark_cases_queued(&self, experiment_id: &str, run_case_ids: &[String]) -> anyhow::Result<()>;

    /// Enforces `status.can_transition_from(previous)`; updates zero rows (and returns
    /// `Ok(false)`) when the transition is not allowed, matching "repository rejects
    /// others silently" in the concurrency model.
    async fn mark_case_status(
        &self,
        experiment_id: &str,
        run_case_id: &str,
        status: CaseStatus,
    ) -> anyhow::Result<bool>;

    async fn persist_case_result(
        &self,
        experiment_id: &str,
        run_case_id: &str,
        result: &CaseResult,
        runtime_snapshot: &RuntimeSnapshot,
    ) -> anyhow::Result<()>;

    async fn fetch_spans_by_run_case(
        &self,
        run_case_id: &str,
        start_ms: i64,
        end_ms: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<SpanRecord>>;

    async fn fetch_logs_by_run_case(
        &self,
        run_case_id: &str,
        start_ms: i64,
        end_ms: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<LogRecord>>;

    async fn persist_spans(&self, spans: &[SpanRecord]) -> anyhow::Result<()>;
    async fn persist_logs(&self, logs: &[LogRecord]) -> anyhow::Result<()>;
}
