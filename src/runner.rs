//! Runs one case end-to-end: mock sidecar, sandbox lifecycle, output
//! parsing, trajectory resolution, scoring. One container per case; the
//! container and sidecar are guaranteed released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::{CaseResult, RunCase, RuntimeSpec, Scorer, TerminalStatus, Usage};
use crate::error::{WorkerError, WorkerResult};
use crate::mock_sidecar::MockSidecarRegistry;
use crate::mock_sidecar::rules::MockConfig;
use crate::otel_collector::OtlpCollector;
use crate::sandbox::{self, RunSpec, SandboxManager};
use crate::scorer::{ScorerPhaseObserver, ScorerPool};
use crate::trajectory::TrajectoryResolver;

/// Phase events the scheduler listens for to drive the case status machine.
/// Matches §4.2's status-cache de-duplication contract: the scheduler is
/// responsible for suppressing repeats, not this runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    SandboxConnect,
    CaseExec,
    OtelQuery,
    ScoreExec,
    ScoreDone,
}

pub trait PhaseCallback: Send + Sync {
    fn on_phase(&self, phase: RunnerPhase);
}

struct ScorerObserverAdapter<'a>(&'a dyn PhaseCallback);

impl ScorerPhaseObserver for ScorerObserverAdapter<'_> {
    fn on_score_start(&self) {
        self.0.on_phase(RunnerPhase::ScoreExec);
    }
    fn on_score_done(&self) {
        self.0.on_phase(RunnerPhase::ScoreDone);
    }
}

const READY_RETRY_MARKERS: &[&str] =
    &["curl: (7)", "connection refused", "failed to connect", "couldn't connect to server"];

pub struct CaseRunner {
    settings: Arc<Settings>,
    sandbox_manager: Arc<dyn SandboxManager>,
    sidecars: Arc<MockSidecarRegistry>,
    collector: Arc<OtlpCollector>,
    trajectory_resolver: Arc<TrajectoryResolver>,
    scorer_pool: Arc<ScorerPool>,
}

impl CaseRunner {
    pub fn new(
        settings: Arc<Settings>,
        sandbox_manager: Arc<dyn SandboxManager>,
        sidecars: Arc<MockSidecarRegistry>,
        collector: Arc<OtlpCollector>,
        trajectory_resolver: Arc<TrajectoryResolver>,
        scorer_pool: Arc<ScorerPool>,
    ) -> Self {
        Self { settings, sandbox_manager, sidecars, collector, trajectory_resolver, scorer_pool }
    }

    pub async fn run(
        &self,
        experiment_id: &str,
        dataset_id: &str,
        case: &RunCase,
        runtime_spec: &RuntimeSpec,
        scorers: &[Scorer],
        phase: &dyn PhaseCallback,
    ) -> CaseResult {
        let start = Instant::now();
        let mut usage = Usage::default();

        let mut result = match self.start_mock_sidecar(case).await {
            Ok(sidecar_endpoint) => {
                let outcome = self
                    .run_sandboxed(experiment_id, dataset_id, case, runtime_spec, &sidecar_endpoint, phase, &mut usage)
                    .await;
                self.sidecars.release(&case.run_case_id).await;
                match outcome {
                    Ok(result) => result,
                    Err(e) => self.failed_result(case, sidecar_endpoint, Some(e.to_string()), start, usage.clone()),
                }
            }
            Err(e) => self.failed_result(case, None, Some(e.to_string()), start, usage.clone()),
        };

        let case_failed = !matches!(result.status, TerminalStatus::Success);
        let user_input = json!(case.user_input);
        let trajectory_value = json!(result.trajectory);
        let reference_output = case.reference_output.clone().unwrap_or(Value::Null);
        let scored = self
            .scorer_pool
            .score_all(
                case_failed,
                scorers,
                &user_input,
                &trajectory_value,
                &result.output,
                &reference_output,
                &ScorerObserverAdapter(phase),
            )
            .await;
        result.scorer_results = scored;
        result.latency_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn start_mock_sidecar(&self, case: &RunCase) -> WorkerResult<Option<String>> {
        let Some(raw_config) = &case.mock_config else { return Ok(None) };
        let config: MockConfig = serde_json::from_value(raw_config.clone())
            .map_err(|e| WorkerError::Other(anyhow::anyhow!("invalid mock_config: {e}")))?;
        let endpoint = self.sidecars.acquire(&case.run_case_id, config, self.collector.clone()).await?;
        Ok(Some(endpoint))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_sandboxed(
        &self,
        experiment_id: &str,
        dataset_id: &str,
        case: &RunCase,
        runtime_spec: &RuntimeSpec,
        sidecar_endpoint: &Option<String>,
        phase: &dyn PhaseCallback,
        usage: &mut Usage,
    ) -> WorkerResult<CaseResult> {
        let pull_started = Instant::now();
        self.sandbox_manager
            .prepare(
                &runtime_spec.agent_image,
                runtime_spec.pull_policy(),
                Duration::from_secs(runtime_spec.pull_timeout_seconds.unwrap_or(self.settings.docker_pull_timeout_seconds)),
            )
            .await?;
        usage.pull_ms = Some(pull_started.elapsed().as_millis() as u64);

        let run_started = Instant::now();
        let env = self.build_env(experiment_id, dataset_id, case, runtime_spec, sidecar_endpoint);
        let spec = RunSpec {
            name: format!("bench-case-{}", case.run_case_id),
            image: runtime_spec.agent_image.clone(),
            command: runtime_spec.agent_command.as_ref().map(|c| shell_words::split(c).unwrap_or_default()),
            env,
            network: runtime_spec.docker_network.clone().or_else(|| self.settings.docker_network.clone()),
            map_host_gateway: cfg!(target_os = "linux"),
        };
        let container = self
            .sandbox_manager
            .run(spec, Duration::from_secs(runtime_spec.run_timeout_seconds.unwrap_or(self.settings.docker_run_timeout_seconds)))
            .await?;
        phase.on_phase(RunnerPhase::SandboxConnect);
        usage.run_ms = Some(run_started.elapsed().as_millis() as u64);

        let exec_started = Instant::now();
        let outcome = if let Some(exec_command) = &runtime_spec.case_exec_command {
            container
                .wait_ready(runtime_spec.startup_poll_interval(), runtime_spec.startup_timeout())
                .await?;

            let command = shell_words::split(exec_command).unwrap_or_default();
            let mut outcome = self.exec_with_readiness_retry(container.as_ref(), &command, runtime_spec).await?;
            phase.on_phase(RunnerPhase::CaseExec);

            if outcome.exit_code == 0 {
                if let Some(after) = &runtime_spec.after_exec_command {
                    let after_command = shell_words::split(after).unwrap_or_default();
                    let _ = container.exec(&after_command, Duration::from_secs(60)).await;
                }
            }

            let full_logs = container.logs().await.unwrap_or_default();
            outcome.logs = full_logs;
            outcome
        } else {
            let timeout = Duration::from_secs(self.settings.case_timeout_seconds);
            let outcome = container.wait_and_collect_logs(timeout).await?;
            phase.on_phase(RunnerPhase::CaseExec);
            outcome
        };
        usage.exec_ms = Some(exec_started.elapsed().as_millis() as u64);

        let container_id = container.container_id().to_string();
        container.remove().await.ok();

        let (output, mut trajectory) = sandbox::parse_agent_output(&outcome.logs);
        trajectory = crate::trajectory::normalize_agent_trajectory(trajectory);

        let status = if outcome.exit_code == 0 { TerminalStatus::Success } else { TerminalStatus::Failed };
        let error_message = if outcome.exit_code != 0 {
            Some(WorkerError::CaseExecNonZero(outcome.exit_code).to_string())
        } else {
            None
        };

        if trajectory.is_empty() {
            phase.on_phase(RunnerPhase::OtelQuery);
            let now_ms = chrono::Utc::now().timestamp_millis();
            let window_start = now_ms - (exec_started.elapsed().as_millis() as i64) - 5_000;
            if let Ok(resolved) = self.trajectory_resolver.resolve(&case.run_case_id, window_start, now_ms).await {
                trajectory = resolved;
            }
        }

        Ok(CaseResult {
            run_case_id: case.run_case_id.clone(),
            status,
            trajectory,
            output,
            logs: outcome.logs,
            error_message,
            exit_code: Some(outcome.exit_code),
            latency_ms: 0,
            container_id: Some(container_id),
            container_image: runtime_spec.agent_image.clone(),
            mock_sidecar_endpoint: sidecar_endpoint.clone(),
            inspect_eval_id: None,
            inspect_sample_id: None,
            scorer_results: vec![],
            usage: usage.clone(),
        })
    }

    async fn exec_with_readiness_retry(
        &self,
        container: &dyn crate::sandbox::Sandbox,
        command: &[String],
        runtime_spec: &RuntimeSpec,
    ) -> WorkerResult<crate::sandbox::ExecOutcome> {
        let deadline = Instant::now() + runtime_spec.startup_timeout();
        loop {
            let outcome = container.exec(command, Duration::from_secs(self.settings.case_timeout_seconds)).await?;
            let not_ready = outcome.exit_code == 7
                || READY_RETRY_MARKERS.iter().any(|marker| outcome.logs.to_lowercase().contains(marker));
            if !not_ready || Instant::now() >= deadline {
                return Ok(outcome);
            }
            warn!(run_case = %runtime_spec.agent_image, "agent not ready, retrying exec");
            tokio::time::sleep(runtime_spec.startup_poll_interval()).await;
        }
    }

    fn build_env(
        &self,
        experiment_id: &str,
        dataset_id: &str,
        case: &RunCase,
        runtime_spec: &RuntimeSpec,
        sidecar_endpoint: &Option<String>,
    ) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("BENCHMARK_EXPERIMENT_ID".to_string(), experiment_id.to_string());
        env.insert("BENCHMARK_DATASET_ID".to_string(), dataset_id.to_string());
        env.insert("BENCHMARK_RUN_CASE_ID".to_string(), case.run_case_id.clone());
        env.insert("BENCHMARK_DATA_ITEM_ID".to_string(), case.data_item_id.clone());
        env.insert("BENCHMARK_ATTEMPT_NO".to_string(), case.attempt_no.to_string());
        env.insert("BENCHMARK_USER_INPUT".to_string(), case.user_input.clone());
        if let Some(session) = &case.session_jsonl {
            env.insert("BENCHMARK_SESSION_JSONL".to_string(), session.clone());
        }
        if let Some(trace_id) = &case.trace_id {
            env.insert("BENCHMARK_TRACE_ID".to_string(), trace_id.clone());
        }
        env.insert(
            "BENCHMARK_AGENT_RUNTIME_SPEC".to_string(),
            serde_json::to_string(runtime_spec).unwrap_or_default(),
        );
        env.insert(
            "BENCHMARK_MOCK_CONFIG".to_string(),
            case.mock_config.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        );
        if let Some(endpoint) = sidecar_endpoint {
            env.insert("BENCHMARK_MOCK_BASE_URL".to_string(), endpoint.clone());
        }

        env.extend(runtime_spec.agent_env_template.clone());

        let resource_attrs = sandbox::merge_otel_resource_attributes(
            env.get("OTEL_RESOURCE_ATTRIBUTES").map(String::as_str),
            experiment_id,
            &case.run_case_id,
            &case.data_item_id,
        );
        env.insert("OTEL_RESOURCE_ATTRIBUTES".to_string(), resource_attrs);
        let otlp_headers = sandbox::merge_otlp_headers(
            env.get("OTEL_EXPORTER_OTLP_HEADERS").map(String::as_str),
            experiment_id,
            &case.run_case_id,
            &case.data_item_id,
        );
        env.insert("OTEL_EXPORTER_OTLP_HEADERS".to_string(), otlp_headers.clone());
        env.insert("OTEL_EXPORTER_OTLP_TRACES_HEADERS".to_string(), otlp_headers);

        if let Some(endpoint) = sidecar_endpoint {
            for key in ["HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY"] {
                env.insert(key.to_string(), endpoint.clone());
            }
            for key in ["http_proxy", "https_proxy", "all_proxy"] {
                env.insert(key.to_string(), endpoint.clone());
            }
            let no_proxy = sandbox::merge_no_proxy(env.get("NO_PROXY").map(String::as_str));
            env.insert("NO_PROXY".to_string(), no_proxy.clone());
            env.insert("no_proxy".to_string(), no_proxy);
        }

        env
    }

    fn failed_result(
        &self,
        case: &RunCase,
        sidecar_endpoint: Option<String>,
        error_message: Option<String>,
        start: Instant,
        usage: Usage,
    ) -> CaseResult {
        info!(run_case_id = %case.run_case_id, error = ?error_message, "case failed before scoring");
        CaseResult {
            run_case_id: case.run_case_id.clone(),
            status: TerminalStatus::Failed,
            trajectory: vec![],
            output: Value::Null,
            logs: String::new(),
            error_message,
            exit_code: None,
            latency_ms: start.elapsed().as_millis() as u64,
            container_id: None,
            container_image: String::new(),
            mock_sidecar_endpoint: sidecar_endpoint,
            inspect_eval_id: None,
            inspect_sample_id: None,
            scorer_results: vec![],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_retry_markers_cover_documented_failure_strings() {
        assert!(READY_RETRY_MARKERS.contains(&"curl: (7)"));
        assert!(READY_RETRY_MARKERS.contains(&"connection refused"));
    }
}
