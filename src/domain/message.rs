//! The inbound `experiment.run.requested` message shape and the per-case
//! request data it carries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PullPolicy;

/// The currently supported message type and schema version. Anything else
/// is rejected by [`crate::parser::validate`] before any side effect runs.
pub const SUPPORTED_MESSAGE_TYPE: &str = "experiment.run.requested";
pub const SUPPORTED_SCHEMA_VERSION: &str = "1.0";

/// Immutable per-consumption message read off the broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: String,
    pub message_type: String,
    pub schema_version: String,
    pub experiment: Experiment,
    pub dataset: Dataset,
    pub agent: Agent,
    pub run_cases: Vec<RunCase>,
    #[serde(default)]
    pub scorers: Vec<Scorer>,
    #[serde(default)]
    pub consumer_hints: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Agent {
    pub id: String,
    pub runtime_spec: RuntimeSpec,
}

/// Opaque-to-the-scheduler sandbox configuration, interpreted entirely by
/// `crate::sandbox`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeSpec {
    pub agent_image: String,
    #[serde(default)]
    pub agent_command: Option<String>,
    #[serde(default)]
    pub case_exec_command: Option<String>,
    #[serde(default)]
    pub after_exec_command: Option<String>,
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
    #[serde(default)]
    pub pull_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub run_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub inspect_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub startup_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub startup_poll_interval_seconds: Option<u64>,
    #[serde(default)]
    pub docker_network: Option<String>,
    #[serde(default)]
    pub agent_env_template: HashMap<String, String>,
}

impl RuntimeSpec {
    /// Resolves the effective pull policy, defaulting to `if-not-present`
    /// per the run-case-level default (distinct from the worker-wide
    /// `Settings::docker_pull_policy` fallback — see DESIGN.md).
    pub fn pull_policy(&self) -> PullPolicy {
        self.pull_policy.unwrap_or_default()
    }

    pub fn startup_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.startup_poll_interval_seconds.unwrap_or(2))
    }

    pub fn startup_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.startup_timeout_seconds.unwrap_or(60))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunCase {
    pub run_case_id: String,
    pub data_item_id: String,
    #[serde(default)]
    pub attempt_no: u32,
    #[serde(default)]
    pub session_jsonl: Option<String>,
    pub user_input: String,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub reference_trajectory: Option<Value>,
    #[serde(default)]
    pub reference_output: Option<Value>,
    #[serde(default)]
    pub mock_config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scorer {
    pub name: String,
    pub api_style: ScorerApiStyle,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub scorer_config: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerApiStyle {
    Openai,
    Anthropic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_spec_defaults_pull_policy_to_if_not_present() {
        let spec: RuntimeSpec = serde_json::from_str(r#"{"agent_image":"img:latest"}"#).unwrap();
        assert_eq!(spec.pull_policy(), PullPolicy::IfNotPresent);
    }

    #[test]
    fn message_deserializes_minimal_payload() {
        let raw = serde_json::json!({
            "message_id": "m-1",
            "message_type": "experiment.run.requested",
            "schema_version": "1.0",
            "experiment": {"id": "exp-1"},
            "dataset": {"id": "ds-1"},
            "agent": {"id": "agent-1", "runtime_spec": {"agent_image": "img:latest"}},
            "run_cases": [],
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.message_id, "m-1");
        assert!(msg.run_cases.is_empty());
        assert!(msg.scorers.is_empty());
    }
}
