//! PostgreSQL-backed [`super::Repository`].
//!
//! Tables are created idempotently at startup (`CREATE TABLE IF NOT EXISTS`)
//! rather than through a migration runner — this worker owns a narrow slice
//! of a larger schema and is not the source of truth for the `experiments`
//! and `run_cases` tables it mutates, but the worker must be able to stand
//! up its own scratch database for integration tests.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::config::PostgresSettings;
use crate::domain::{CaseResult, CaseStatus, LogRecord, SpanRecord};
use crate::reconciler::{self, CaseCounts};

use super::{ExperimentQueueState, Repository, RuntimeSnapshot};

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(settings: &PostgresSettings) -> anyhow::Result<Self> {
        let pool = PgPool::connect(&settings.url()).await?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                queue_status TEXT NOT NULL DEFAULT 'idle',
                queue_message_id TEXT,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_cases (
                experiment_id TEXT NOT NULL,
                run_case_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                is_latest BOOLEAN NOT NULL DEFAULT true,
                final_score DOUBLE PRECISION,
                exit_code BIGINT,
                error_message TEXT,
                latency_ms BIGINT,
                container_id TEXT,
                container_image TEXT,
                runtime_snapshot JSONB,
                output JSONB,
                trajectory JSONB,
                started_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (experiment_id, run_case_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scorer_results (
                experiment_id TEXT NOT NULL,
                run_case_id TEXT NOT NULL,
                scorer_name TEXT NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                reason TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spans (
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                benchmark_run_case_id TEXT,
                benchmark_experiment_id TEXT,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                trace_id TEXT,
                span_id TEXT,
                benchmark_run_case_id TEXT,
                benchmark_experiment_id TEXT,
                event_time TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Runs the reconciler inside `tx`, honoring stickiness. Called from
    /// every case-status-changing operation so the experiment's aggregate
    /// state never drifts from its cases.
    async fn reconcile_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        experiment_id: &str,
    ) -> anyhow::Result<()> {
        let current_status: Option<String> =
            sqlx::query_scalar("SELECT queue_status FROM experiments WHERE id = $1")
                .bind(experiment_id)
                .fetch_optional(&mut **tx)
                .await?;

        if current_status.as_deref() == Some("manual_terminated") {
            return Ok(());
        }

        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE is_latest) AS total,
                count(*) FILTER (WHERE is_latest AND status IN ('running','trajectory','scoring')) AS running,
                count(*) FILTER (WHERE is_latest AND status IN ('pending','queued')) AS pending,
                count(*) FILTER (WHERE is_latest AND status = 'success') AS success,
                count(*) FILTER (WHERE is_latest AND status IN ('failed','timeout')) AS failed
            FROM run_cases WHERE experiment_id = $1
            "#,
        )
        .bind(experiment_id)
        .fetch_one(&mut **tx)
        .await?;

        let counts = CaseCounts {
            total: row.try_get("total")?,
            running: row.try_get("running")?,
            pending: row.try_get("pending")?,
            success: row.try_get("success")?,
            failed: row.try_get("failed")?,
        };
        let run_status = reconciler::derive_run_status(counts);

        if !reconciler::should_write(current_status.as_deref()) {
            return Ok(());
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE experiments SET
                queue_status = $2,
                started_at = CASE WHEN $2 = 'consuming' AND started_at IS NULL THEN $3 ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('done','failed') THEN $3 ELSE finished_at END
            WHERE id = $1
            "#,
        )
        .bind(experiment_id)
        .bind(run_status.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_experiment_queue_state(&self, experiment_id: &str) -> anyhow::Result<ExperimentQueueState> {
        let row = sqlx::query("SELECT queue_status, queue_message_id FROM experiments WHERE id = $1")
            .bind(experiment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => ExperimentQueueState {
                queue_status: row.try_get("queue_status")?,
                queue_message_id: row.try_get("queue_message_id")?,
            },
            None => ExperimentQueueState::default(),
        })
    }

    async fn mark_cases_queued(&self, experiment_id: &str, run_case_ids: &[String]) -> anyhow::Result<()> {
        if run_case_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE run_cases SET status = 'queued', updated_at = now()
            WHERE experiment_id = $1 AND run_case_id = ANY($2) AND status = 'pending'
            "#,
        )
        .bind(experiment_id)
        .bind(run_case_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_case_status(
        &self,
        experiment_id: &str,
        run_case_id: &str,
        status: CaseStatus,
    ) -> anyhow::Result<bool> {
        let previous: Option<String> = sqlx::query_scalar(
            "SELECT status FROM run_cases WHERE experiment_id = $1 AND run_case_id = $2",
        )
        .bind(experiment_id)
        .bind(run_case_id)
        .fetch_optional(&self.pool)
        .await?;

        let previous_status = match previous.as_deref() {
            Some("pending") => CaseStatus::Pending,
            Some("queued") => CaseStatus::Queued,
            Some("running") => CaseStatus::Running,
            Some("trajectory") => CaseStatus::Trajectory,
            Some("scoring") => CaseStatus::Scoring,
            Some("success") => CaseStatus::Success,
            Some("failed") => CaseStatus::Failed,
            Some("timeout") => CaseStatus::Timeout,
            _ => return Ok(false),
        };
        // Terminal rows are immutable: once success/failed/timeout lands, no
        // further status write is accepted, even one `can_transition_from`
        // would otherwise allow.
        if previous_status.is_terminal() || !status.can_transition_from(previous_status) {
            return Ok(false);
        }

        let status_str = serde_json::to_value(status)?.as_str().unwrap().to_string();
        let sets_started_at = status == CaseStatus::Running;
        sqlx::query(
            r#"
            UPDATE run_cases SET
                status = $3,
                started_at = CASE WHEN $4 AND started_at IS NULL THEN now() ELSE started_at END,
                updated_at = now()
            WHERE experiment_id = $1 AND run_case_id = $2
            "#,
        )
        .bind(experiment_id)
        .bind(run_case_id)
        .bind(&status_str)
        .bind(sets_started_at)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn persist_case_result(
        &self,
        experiment_id: &str,
        run_case_id: &str,
        result: &CaseResult,
        runtime_snapshot: &RuntimeSnapshot,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let status_str = serde_json::to_value(CaseStatus::from(result.status))?
            .as_str()
            .unwrap()
            .to_string();

        sqlx::query(
            r#"
            UPDATE run_cases SET
                status = $3,
                final_score = $4,
                exit_code = $5,
                error_message = $6,
                latency_ms = $7,
                container_id = $8,
                container_image = $9,
                runtime_snapshot = $10,
                output = $11,
                trajectory = $12,
                updated_at = now()
            WHERE experiment_id = $1 AND run_case_id = $2
            "#,
        )
        .bind(experiment_id)
        .bind(run_case_id)
        .bind(&status_str)
        .bind(result.final_score())
        .bind(result.exit_code)
        .bind(&result.error_message)
        .bind(result.latency_ms as i64)
        .bind(&result.container_id)
        .bind(&result.container_image)
        .bind(serde_json::to_value(runtime_snapshot)?)
        .bind(&result.output)
        .bind(serde_json::to_value(&result.trajectory)?)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM scorer_results WHERE experiment_id = $1 AND run_case_id = $2")
            .bind(experiment_id)
            .bind(run_case_id)
            .execute(&mut *tx)
            .await?;

        for scorer in &result.scorer_results {
            sqlx::query(
                "INSERT INTO scorer_results (experiment_id, run_case_id, scorer_name, score, reason) VALUES ($1,$2,$3,$4,$5)",
            )
            .bind(experiment_id)
            .bind(run_case_id)
            .bind(&scorer.scorer_name)
            .bind(scorer.score)
            .bind(&scorer.reason)
            .execute(&mut *tx)
            .await?;
        }

        Self::reconcile_tx(&mut tx, experiment_id).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_spans_by_run_case(
        &self,
        run_case_id: &str,
        start_ms: i64,
        end_ms: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<SpanRecord>> {
        let start = chrono::DateTime::from_timestamp_millis(start_ms).unwrap_or(Utc::now());
        let end = chrono::DateTime::from_timestamp_millis(end_ms).unwrap_or(Utc::now());
        let rows = sqlx::query(
            r#"
            SELECT record FROM spans
            WHERE benchmark_run_case_id = $1 AND start_time >= $2 AND start_time <= $3
            ORDER BY start_time ASC LIMIT $4
            "#,
        )
        .bind(run_case_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("record")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn fetch_logs_by_run_case(
        &self,
        run_case_id: &str,
        start_ms: i64,
        end_ms: i64,
        limit: i64,
    ) -> anyhow::Result<Vec<LogRecord>> {
        let start = chrono::DateTime::from_timestamp_millis(start_ms).unwrap_or(Utc::now());
        let end = chrono::DateTime::from_timestamp_millis(end_ms).unwrap_or(Utc::now());
        let rows = sqlx::query(
            r#"
            SELECT record FROM logs
            WHERE benchmark_run_case_id = $1 AND event_time >= $2 AND event_time <= $3
            ORDER BY event_time ASC LIMIT $4
            "#,
        )
        .bind(run_case_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("record")?;
                Ok(serde_json::from_value(value)?)
            })
            .collect()
    }

    async fn persist_spans(&self, spans: &[SpanRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for span in spans {
            sqlx::query(
                r#"
                INSERT INTO spans (trace_id, span_id, benchmark_run_case_id, benchmark_experiment_id, start_time, end_time, record)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&span.trace_id)
            .bind(&span.span_id)
            .bind(&span.benchmark_run_case_id)
            .bind(&span.benchmark_experiment_id)
            .bind(span.start_time)
            .bind(span.end_time)
            .bind(serde_json::to_value(span)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn persist_logs(&self, logs: &[LogRecord]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for log in logs {
            sqlx::query(
                r#"
                INSERT INTO logs (trace_id, span_id, benchmark_run_case_id, benchmark_experiment_id, event_time, record)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&log.trace_id)
            .bind(&log.span_id)
            .bind(&log.benchmark_run_case_id)
            .bind(&log.benchmark_experiment_id)
            .bind(log.event_time)
            .bind(serde_json::to_value(log)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
