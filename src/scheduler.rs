//! Bounded concurrent execution of one message's run cases, with per-case
//! status-transition reporting and whole-message retry on any failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::{CaseResult, CaseStatus, Message, RunCase, TerminalStatus};
use crate::error::{WorkerError, WorkerResult};
use crate::repository::{Repository, RuntimeSnapshot};
use crate::runner::{CaseRunner, PhaseCallback, RunnerPhase};

const RETRY_BACKOFF_UNIT_SECONDS: f64 = 0.5;

pub struct Scheduler {
    settings: Arc<Settings>,
    repository: Arc<dyn Repository>,
    runner: Arc<CaseRunner>,
}

impl Scheduler {
    pub fn new(settings: Arc<Settings>, repository: Arc<dyn Repository>, runner: Arc<CaseRunner>) -> Self {
        Self { settings, repository, runner }
    }

    /// Runs every case in `message`, retrying the whole batch of still-failing
    /// cases up to `max_message_retries` times with linear backoff. Returns
    /// `Err(WorkerError::RunRetriesExceeded)` once the budget is exhausted with
    /// at least one case still not `success`.
    pub async fn process(&self, message: &Message) -> WorkerResult<()> {
        let queue_state = self
            .repository
            .get_experiment_queue_state(&message.experiment.id)
            .await
            .map_err(WorkerError::Other)?;

        if queue_state.queue_status.as_deref() == Some("manual_terminated") {
            info!(experiment_id = %message.experiment.id, "experiment manually terminated, skipping message");
            return Ok(());
        }
        if let Some(existing_message_id) = &queue_state.queue_message_id {
            if existing_message_id != &message.message_id {
                info!(
                    experiment_id = %message.experiment.id,
                    existing_message_id,
                    incoming_message_id = %message.message_id,
                    "stale queue_message_id, skipping message",
                );
                return Ok(());
            }
        }

        if message.run_cases.is_empty() {
            return Ok(());
        }

        let total = message.run_cases.len();
        let run_case_ids: Vec<String> = message.run_cases.iter().map(|c| c.run_case_id.clone()).collect();
        self.repository
            .mark_cases_queued(&message.experiment.id, &run_case_ids)
            .await
            .map_err(WorkerError::Other)?;

        let mut pending: Vec<&RunCase> = message.run_cases.iter().collect();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let results = self.run_batch(message, &pending).await;

            let mut failed: Vec<&RunCase> = Vec::new();
            for result in &results {
                self.persist(message, result).await;
                if !matches!(result.status, TerminalStatus::Success) {
                    if let Some(case) = message.run_cases.iter().find(|c| c.run_case_id == result.run_case_id) {
                        failed.push(case);
                    }
                }
            }

            if failed.is_empty() {
                return Ok(());
            }
            if attempt >= self.settings.max_message_retries {
                return Err(WorkerError::RunRetriesExceeded { failures: failed.len(), total, attempts: attempt });
            }

            let backoff = Duration::from_secs_f64(attempt as f64 * RETRY_BACKOFF_UNIT_SECONDS);
            warn!(attempt, failed = failed.len(), backoff = ?backoff, "retrying failed cases");
            tokio::time::sleep(backoff).await;
            pending = failed;
        }
    }

    async fn run_batch(&self, message: &Message, cases: &[&RunCase]) -> Vec<CaseResult> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrent_cases.max(1)));
        let mut handles = Vec::with_capacity(cases.len());

        for case in cases {
            let case = (*case).clone();
            let runtime_spec = message.agent.runtime_spec.clone();
            let scorers = message.scorers.clone();
            let experiment_id = message.experiment.id.clone();
            let dataset_id = message.dataset.id.clone();
            let runner = self.runner.clone();
            let repository = self.repository.clone();
            let permit = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let tracker = CaseStatusTracker::new(repository, experiment_id.clone(), case.run_case_id.clone());
                runner.run(&experiment_id, &dataset_id, &case, &runtime_spec, &scorers, &tracker).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        results
    }

    async fn persist(&self, message: &Message, result: &CaseResult) {
        let pull_policy = serde_json::to_value(message.agent.runtime_spec.pull_policy())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let runtime_snapshot = RuntimeSnapshot {
            agent_image: message.agent.runtime_spec.agent_image.clone(),
            pull_policy,
            docker_network: message.agent.runtime_spec.docker_network.clone(),
        };
        if let Err(e) = self
            .repository
            .persist_case_result(&message.experiment.id, &result.run_case_id, result, &runtime_snapshot)
            .await
        {
            warn!(error = %e, run_case_id = %result.run_case_id, "failed to persist case result");
        }
    }
}

/// Maps [`RunnerPhase`] events to [`CaseStatus`] writes, suppressing repeats
/// via a last-written cache and refcounting the scoring phase so a case with
/// several scorers only flips to `scoring` once and back to `trajectory`
/// after the last one finishes.
struct CaseStatusTracker {
    repository: Arc<dyn Repository>,
    experiment_id: String,
    run_case_id: String,
    last_written: Mutex<Option<CaseStatus>>,
    scoring_refcount: AtomicU32,
}

impl CaseStatusTracker {
    fn new(repository: Arc<dyn Repository>, experiment_id: String, run_case_id: String) -> Self {
        Self {
            repository,
            experiment_id,
            run_case_id,
            last_written: Mutex::new(None),
            scoring_refcount: AtomicU32::new(0),
        }
    }

    fn write(&self, status: CaseStatus) {
        {
            let mut last = self.last_written.lock().unwrap();
            if *last == Some(status) {
                return;
            }
            *last = Some(status);
        }

        let repository = self.repository.clone();
        let experiment_id = self.experiment_id.clone();
        let run_case_id = self.run_case_id.clone();
        tokio::spawn(async move {
            if let Err(e) = repository.mark_case_status(&experiment_id, &run_case_id, status).await {
                warn!(error = %e, run_case_id, "failed to write case status");
            }
        });
    }
}

impl PhaseCallback for CaseStatusTracker {
    fn on_phase(&self, phase: RunnerPhase) {
        match phase {
            RunnerPhase::SandboxConnect | RunnerPhase::CaseExec => self.write(CaseStatus::Running),
            RunnerPhase::OtelQuery => self.write(CaseStatus::Trajectory),
            RunnerPhase::ScoreExec => {
                if self.scoring_refcount.fetch_add(1, Ordering::SeqCst) == 0 {
                    self.write(CaseStatus::Scoring);
                }
            }
            RunnerPhase::ScoreDone => {
                if self.scoring_refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.write(CaseStatus::Trajectory);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LogRecord, SpanRecord};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingRepository {
        statuses: AsyncMutex<Vec<CaseStatus>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Repository for RecordingRepository {
        async fn get_experiment_queue_state(
            &self,
            _experiment_id: &str,
        ) -> anyhow::Result<crate::repository::ExperimentQueueState> {
            Ok(crate::repository::ExperimentQueueState::default())
        }
        async fn mark_cases_queued(&self, _experiment_id: &str, _run_case_ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_case_status(
            &self,
            _experiment_id: &str,
            _run_case_id: &str,
            status: CaseStatus,
        ) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().await.push(status);
            Ok(true)
        }
        async fn persist_case_result(
            &self,
            _experiment_id: &str,
            _run_case_id: &str,
            _result: &CaseResult,
            _runtime_snapshot: &RuntimeSnapshot,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn fetch_spans_by_run_case(
            &self,
            _run_case_id: &str,
            _start_ms: i64,
            _end_ms: i64,
            _limit: i64,
        ) -> anyhow::Result<Vec<SpanRecord>> {
            Ok(vec![])
        }
        async fn fetch_logs_by_run_case(
            &self,
            _run_case_id: &str,
            _start_ms: i64,
            _end_ms: i64,
            _limit: i64,
        ) -> anyhow::Result<Vec<LogRecord>> {
            Ok(vec![])
        }
        async fn persist_spans(&self, _spans: &[SpanRecord]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn persist_logs(&self, _logs: &[LogRecord]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn repeated_running_phase_writes_status_once() {
        let repo = Arc::new(RecordingRepository { statuses: AsyncMutex::new(vec![]), calls: AtomicUsize::new(0) });
        let tracker = CaseStatusTracker::new(repo.clone(), "exp-1".into(), "case-1".into());
        tracker.on_phase(RunnerPhase::SandboxConnect);
        tracker.on_phase(RunnerPhase::CaseExec);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(repo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*repo.statuses.lock().await, vec![CaseStatus::Running]);
    }

    #[tokio::test]
    async fn scoring_refcount_only_flips_once_for_multiple_scorers() {
        let repo = Arc::new(RecordingRepository { statuses: AsyncMutex::new(vec![]), calls: AtomicUsize::new(0) });
        let tracker = CaseStatusTracker::new(repo.clone(), "exp-1".into(), "case-1".into());
        tracker.on_phase(RunnerPhase::ScoreExec);
        tracker.on_phase(RunnerPhase::ScoreExec);
        tracker.on_phase(RunnerPhase::ScoreDone);
        tracker.on_phase(RunnerPhase::ScoreDone);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*repo.statuses.lock().await, vec![CaseStatus::Scoring, CaseStatus::Trajectory]);
    }
}
