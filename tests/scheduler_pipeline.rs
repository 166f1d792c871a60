//! Drives `Scheduler::process` end to end against a fake `Sandbox`/`Repository`
//! (no Docker daemon, no RabbitMQ, no database) and feeds the resulting case
//! statuses into `reconciler::derive_run_status` to check the two stay
//! consistent — the same seam `PostgresRepository` crosses inside a real
//! transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use benchmark_worker::config::{
    EvaluatorSettings, OtelSettings, PostgresSettings, PullPolicy, RabbitMqSettings, RedisSettings, Settings,
};
use benchmark_worker::domain::{
    Agent, CaseResult, CaseStatus, Dataset, Experiment, LogRecord, Message, RunCase, RuntimeSpec, SpanRecord,
};
use benchmark_worker::mock_sidecar::MockSidecarRegistry;
use benchmark_worker::reconciler::{self, CaseCounts};
use benchmark_worker::repository::{ExperimentQueueState, Repository, RuntimeSnapshot};
use benchmark_worker::runner::CaseRunner;
use benchmark_worker::sandbox::{ExecOutcome, RunSpec, Sandbox, SandboxManager};
use benchmark_worker::scheduler::Scheduler;
use benchmark_worker::scorer::ScorerPool;
use benchmark_worker::trajectory::TrajectoryResolver;
use benchmark_worker::OtlpCollector;

/// An in-memory stand-in for `PostgresRepository`: records every case-status
/// write and persisted result instead of touching a database.
#[derive(Default)]
struct FakeRepository {
    statuses: Mutex<HashMap<String, CaseStatus>>,
    results: Mutex<HashMap<String, CaseResult>>,
}

#[async_trait]
impl Repository for FakeRepository {
    async fn get_experiment_queue_state(&self, _experiment_id: &str) -> anyhow::Result<ExperimentQueueState> {
        Ok(ExperimentQueueState::default())
    }

    async fn mark_cases_queued(&self, _experiment_id: &str, run_case_ids: &[String]) -> anyhow::Result<()> {
        let mut statuses = self.statuses.lock().unwrap();
        for id in run_case_ids {
            statuses.insert(id.clone(), CaseStatus::Queued);
        }
        Ok(())
    }

    async fn mark_case_status(
        &self,
        _experiment_id: &str,
        run_case_id: &str,
        status: CaseStatus,
    ) -> anyhow::Result<bool> {
        let mut statuses = self.statuses.lock().unwrap();
        let previous = statuses.get(run_case_id).copied().unwrap_or(CaseStatus::Pending);
        if !status.can_transition_from(previous) {
            return Ok(false);
        }
        statuses.insert(run_case_id.to_string(), status);
        Ok(true)
    }

    async fn persist_case_result(
        &self,
        _experiment_id: &str,
        run_case_id: &str,
        result: &CaseResult,
        _runtime_snapshot: &RuntimeSnapshot,
    ) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().insert(run_case_id.to_string(), result.status.into());
        self.results.lock().unwrap().insert(run_case_id.to_string(), result.clone());
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

impl FakeRepository {
    fn counts(&self) -> CaseCounts {
        let statuses = self.statuses.lock().unwrap();
        let mut counts = CaseCounts { total: statuses.len() as i64, ..Default::default() };
        for status in statuses.values() {
            match status {
                CaseStatus::Pending | CaseStatus::Queued => counts.pending += 1,
                CaseStatus::Running | CaseStatus::Trajectory | CaseStatus::Scoring => counts.running += 1,
                CaseStatus::Success => counts.success += 1,
                CaseStatus::Failed | CaseStatus::Timeout => counts.failed += 1,
            }
        }
        counts
    }
}

/// A container that never touches Docker: `run` hands back canned exit code
/// and stdout, with the second case (`case-exit-nonzero`) failing.
struct FakeSandbox {
    id: String,
    exit_code: i64,
    logs: String,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn container_id(&self) -> &str {
        &self.id
    }

    async fn wait_ready(&self, _poll_interval: Duration, _timeout: Duration) -> benchmark_worker::WorkerResult<()> {
        Ok(())
    }

    async fn exec(&self, _command: &[String], _timeout: Duration) -> benchmark_worker::WorkerResult<ExecOutcome> {
        Ok(ExecOutcome { exit_code: self.exit_code, logs: self.logs.clone() })
    }

    async fn wait_and_collect_logs(&self, _timeout: Duration) -> benchmark_worker::WorkerResult<ExecOutcome> {
        Ok(ExecOutcome { exit_code: self.exit_code, logs: self.logs.clone() })
    }

    async fn logs(&self) -> benchmark_worker::WorkerResult<String> {
        Ok(self.logs.clone())
    }

    async fn remove(&self) -> benchmark_worker::WorkerResult<()> {
        Ok(())
    }
}

struct FakeSandboxManager {
    next_container: AtomicI64,
}

#[async_trait]
impl SandboxManager for FakeSandboxManager {
    async fn prepare(&self, _image: &str, _policy: PullPolicy, _timeout: Duration) -> benchmark_worker::WorkerResult<()> {
        Ok(())
    }

    async fn run(&self, spec: RunSpec, _timeout: Duration) -> benchmark_worker::WorkerResult<Box<dyn Sandbox>> {
        let id = self.next_container.fetch_add(1, Ordering::SeqCst);
        let failing = spec.name.contains("case-exit-nonzero");
        let body = json!({
            "output": format!("handled {}", spec.name),
            "trajectory": [{"step": 1, "start_time": 1_700_000_000, "name": "respond"}],
        });
        Ok(Box::new(FakeSandbox {
            id: format!("fake-container-{id}"),
            exit_code: if failing { 1 } else { 0 },
            logs: body.to_string(),
        }))
    }
}

fn test_settings() -> Settings {
    Settings {
        rabbitmq: RabbitMqSettings {
            host: "localhost".into(),
            port: 5672,
            user: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            experiment_queue: "experiment.run.requested".into(),
        },
        redis: RedisSettings {
            host: "localhost".into(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            processing_lock_ttl_seconds: 900,
            processed_ttl_seconds: 86_400,
        },
        postgres: PostgresSettings {
            server: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            db: "benchmark".into(),
        },
        otel: OtelSettings {
            enabled: false,
            endpoint: None,
            query_timeout_seconds: 10,
            protocol: "http/protobuf".into(),
            collector_enabled: false,
            collector_host: "0.0.0.0".into(),
            collector_port: 4318,
            collector_path: "/v1/traces".into(),
            public_endpoint: None,
        },
        evaluator: EvaluatorSettings {
            timeout_seconds: 5.0,
            connect_timeout_seconds: 2.0,
            read_timeout_seconds: 5.0,
            max_retries: 0,
            retry_backoff_seconds: 0.1,
            scorer_hard_timeout_seconds: 5.0,
        },
        concurrent_cases: 4,
        scorer_concurrent_cases: 4,
        max_message_retries: 2,
        case_timeout_seconds: 30,
        docker_network: None,
        agent_exec_command: None,
        docker_pull_policy: PullPolicy::IfNotPresent,
        docker_pull_timeout_seconds: 30,
        docker_run_timeout_seconds: 30,
        docker_inspect_timeout_seconds: 10,
    }
}

fn test_message() -> Message {
    Message {
        message_id: "msg-1".into(),
        message_type: "experiment.run.requested".into(),
        schema_version: "1.0".into(),
        experiment: Experiment { id: "exp-1".into(), triggered_by: None },
        dataset: Dataset { id: "ds-1".into(), name: None },
        agent: Agent {
            id: "agent-1".into(),
            runtime_spec: RuntimeSpec {
                agent_image: "agent:latest".into(),
                agent_command: None,
                case_exec_command: None,
                after_exec_command: None,
                pull_policy: None,
                pull_timeout_seconds: None,
                run_timeout_seconds: None,
                inspect_timeout_seconds: None,
                startup_timeout_seconds: None,
                startup_poll_interval_seconds: None,
                docker_network: None,
                agent_env_template: HashMap::new(),
            },
        },
        run_cases: vec![
            RunCase {
                run_case_id: "case-ok".into(),
                data_item_id: "item-1".into(),
                attempt_no: 0,
                session_jsonl: None,
                user_input: "what is 2+2?".into(),
                trace_id: None,
                reference_trajectory: None,
                reference_output: None,
                mock_config: None,
            },
            RunCase {
                run_case_id: "case-exit-nonzero".into(),
                data_item_id: "item-2".into(),
                attempt_no: 0,
                session_jsonl: None,
                user_input: "trigger a failure".into(),
                trace_id: None,
                reference_trajectory: None,
                reference_output: None,
                mock_config: None,
            },
        ],
        scorers: vec![],
        consumer_hints: HashMap::new(),
    }
}

#[tokio::test]
async fn scheduler_runs_every_case_and_reconciler_sees_a_consistent_terminal_state() {
    let settings = Arc::new(test_settings());
    let fake_repo = Arc::new(FakeRepository::default());
    let repository: Arc<dyn Repository> = fake_repo.clone();

    let sandbox_manager: Arc<dyn SandboxManager> = Arc::new(FakeSandboxManager { next_container: AtomicI64::new(0) });
    let collector = OtlpCollector::new(settings.otel.clone(), repository.clone());
    let trajectory_resolver = Arc::new(TrajectoryResolver::new(None, repository.clone()));
    let scorer_pool = Arc::new(ScorerPool::new(settings.evaluator.clone(), settings.scorer_concurrent_cases).unwrap());

    let runner = Arc::new(CaseRunner::new(
        settings.clone(),
        sandbox_manager,
        MockSidecarRegistry::new(),
        collector,
        trajectory_resolver,
        scorer_pool,
    ));

    let scheduler = Scheduler::new(settings.clone(), repository.clone(), runner);
    let message = test_message();

    // One case fails every attempt, so the retry budget (2) is exhausted and
    // the whole message comes back as an error — this is the same shape
    // `Ingestor` nacks-without-requeue on.
    let outcome = scheduler.process(&message).await;
    assert!(outcome.is_err(), "a permanently-failing case should exhaust the retry budget");

    let counts = fake_repo.counts();
    assert_eq!(counts.total, 2);
    assert_eq!(counts.success, 1, "case-ok must have reached success");
    assert_eq!(counts.failed, 1, "case-exit-nonzero must have reached failed");

    assert_eq!(reconciler::derive_run_status(counts), reconciler::RunStatus::Done);

    let results = fake_repo.results.lock().unwrap();
    let ok_result = results.get("case-ok").expect("case-ok result must be persisted");
    assert_eq!(ok_result.output, json!("handled bench-case-case-ok"));
    assert_eq!(ok_result.trajectory[0]["start_time"], json!(1_700_000_000_000i64));

    let failed_result = results.get("case-exit-nonzero").expect("case-exit-nonzero result must be persisted");
    assert!(failed_result.error_message.is_some());
}
