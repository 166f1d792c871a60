//! Ephemeral per-case container lifecycle.
//!
//! One [`SandboxManager`] implementation talks to a single container
//! runtime's API directly (no multi-provider abstraction — this worker only
//! ever targets Docker); the trait boundary exists so [`crate::runner::CaseRunner`]
//! can be tested against a fake without a daemon.

pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PullPolicy;
use crate::error::WorkerResult;

pub use docker::DockerSandboxManager;

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub network: Option<String>,
    /// Linux-only `host.docker.internal` → host-gateway mapping. Desktop
    /// Docker runtimes already provide this alias; forcing it there is a
    /// no-op at best and a startup error at worst.
    pub map_host_gateway: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub logs: String,
}

/// One running container. Returned by [`SandboxManager::run`].
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn container_id(&self) -> &str;

    /// Polls `inspect` every `poll_interval` until the container reports
    /// running, or `timeout` elapses.
    async fn wait_ready(&self, poll_interval: Duration, timeout: Duration) -> WorkerResult<()>;

    async fn exec(&self, command: &[String], timeout: Duration) -> WorkerResult<ExecOutcome>;

    /// Blocks until the container's main process exits, then returns its logs.
    async fn wait_and_collect_logs(&self, timeout: Duration) -> WorkerResult<ExecOutcome>;

    async fn logs(&self) -> WorkerResult<String>;

    async fn remove(&self) -> WorkerResult<()>;
}

#[async_trait]
pub trait SandboxManager: Send + Sync {
    /// Pulls `image` per `policy`. Falls back to a local copy on pull failure
    /// if one exists; fails hard otherwise.
    async fn prepare(&self, image: &str, policy: PullPolicy, timeout: Duration) -> WorkerResult<()>;

    async fn run(&self, spec: RunSpec, timeout: Duration) -> WorkerResult<Box<dyn Sandbox>>;
}

/// Merges `OTEL_RESOURCE_ATTRIBUTES` (a comma-separated `key=value` list),
/// appending the three `benchmark.*` identifiers.
pub fn merge_otel_resource_attributes(
    existing: Option<&str>,
    experiment_id: &str,
    run_case_id: &str,
    data_item_id: &str,
) -> String {
    let mut parts: Vec<String> = existing
        .map(|s| s.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    parts.push(format!("benchmark.experiment_id={experiment_id}"));
    parts.push(format!("benchmark.run_case_id={run_case_id}"));
    parts.push(format!("benchmark.data_item_id={data_item_id}"));
    parts.join(",")
}

/// Merges `OTEL_EXPORTER_OTLP_HEADERS` with the same three identifiers under
/// an `x-benchmark-*` header naming convention.
pub fn merge_otlp_headers(
    existing: Option<&str>,
    experiment_id: &str,
    run_case_id: &str,
    data_item_id: &str,
) -> String {
    let mut parts: Vec<String> = existing
        .map(|s| s.split(',').filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    parts.push(format!("x-benchmark-experiment-id={experiment_id}"));
    parts.push(format!("x-benchmark-run-case-id={run_case_id}"));
    parts.push(format!("x-benchmark-data-item-id={data_item_id}"));
    parts.join(",")
}

/// `NO_PROXY` must include the loopback/gateway hosts, regardless of any
/// value the caller already supplied, so in-container health checks never
/// get routed through the mock sidecar proxy.
pub fn merge_no_proxy(existing: Option<&str>) -> String {
    const REQUIRED: &str = "127.0.0.1,localhost,host.docker.internal";
    match existing {
        Some(value) if !value.is_empty() => format!("{value},{REQUIRED}"),
        _ => REQUIRED.to_string(),
    }
}

/// Extracts `(output, trajectory)` from raw container logs per the
/// three recognized agent-output shapes.
pub fn parse_agent_output(logs: &str) -> (serde_json::Value, Vec<serde_json::Value>) {
    let candidate = logs
        .lines()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str::<serde_json::Value>(trimmed).ok()
            } else {
                None
            }
        })
        .or_else(|| serde_json::from_str::<serde_json::Value>(logs.trim()).ok());

    let Some(value) = candidate else {
        return (serde_json::json!({"raw_stdout": logs}), vec![]);
    };

    if let Some(obj) = value.as_object() {
        if obj.contains_key("output") {
            let trajectory = obj
                .get("trajectory")
                .and_then(|t| t.as_array())
                .cloned()
                .unwrap_or_default();
            return (obj["output"].clone(), trajectory);
        }
        if let Some(content) = obj
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
        {
            return (content.clone(), vec![]);
        }
        if let Some(output) = obj.get("output").and_then(|o| o.as_array()) {
            let text = output
                .iter()
                .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
                .flatten()
                .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
            return (serde_json::Value::String(text), vec![]);
        }
    }

    (serde_json::json!({"raw_stdout": logs}), vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_always_includes_required_hosts() {
        assert_eq!(merge_no_proxy(None), "127.0.0.1,localhost,host.docker.internal");
        assert_eq!(
            merge_no_proxy(Some("10.0.0.1")),
            "10.0.0.1,127.0.0.1,localhost,host.docker.internal"
        );
    }

    #[test]
    fn resource_attributes_append_three_benchmark_ids() {
        let merged = merge_otel_resource_attributes(Some("service.name=agent"), "exp-1", "case-1", "item-1");
        assert_eq!(
            merged,
            "service.name=agent,benchmark.experiment_id=exp-1,benchmark.run_case_id=case-1,benchmark.data_item_id=item-1"
        );
    }

    #[test]
    fn parse_agent_output_recognizes_explicit_shape() {
        let logs = "noise line\n{\"output\": \"done\", \"trajectory\": [1]}\n";
        let (output, trajectory) = parse_agent_output(logs);
        assert_eq!(output, serde_json::json!("done"));
        assert_eq!(trajectory, vec![serde_json::json!(1)]);
    }

    #[test]
    fn parse_agent_output_recognizes_chat_completions_shape() {
        let logs = r#"{"choices":[{"message":{"content":"hello"}}]}"#;
        let (output, trajectory) = parse_agent_output(logs);
        assert_eq!(output, serde_json::json!("hello"));
        assert!(trajectory.is_empty());
    }

    #[test]
    fn parse_agent_output_falls_back_to_raw_stdout() {
        let logs = "just some plain text\nwith no json";
        let (output, _) = parse_agent_output(logs);
        assert_eq!(output["raw_stdout"], logs);
    }
}
