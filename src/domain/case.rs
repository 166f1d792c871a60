//! The case status state machine and the result a [`crate::runner::CaseRunner`]
//! produces for one run case.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `pending → queued → running → trajectory ↔ scoring → success | failed | timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Queued,
    Running,
    Trajectory,
    Scoring,
    Success,
    Failed,
    Timeout,
}

impl CaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }

    /// The set of predecessors from which a transition *to* `self` is permitted.
    /// Terminal states are reachable from any non-terminal state.
    pub fn allowed_predecessors(self) -> &'static [CaseStatus] {
        use CaseStatus::*;
        match self {
            Pending => &[],
            Queued => &[Pending],
            Running => &[Pending, Queued, Trajectory],
            Trajectory => &[Running, Scoring],
            Scoring => &[Running, Trajectory],
            Success | Failed | Timeout => &[Pending, Queued, Running, Trajectory, Scoring],
        }
    }

    pub fn can_transition_from(self, previous: CaseStatus) -> bool {
        self.allowed_predecessors().contains(&previous)
    }
}

/// Result produced by running one case end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub run_case_id: String,
    pub status: TerminalStatus,
    pub trajectory: Vec<Value>,
    pub output: Value,
    pub logs: String,
    pub error_message: Option<String>,
    pub exit_code: Option<i64>,
    pub latency_ms: u64,
    pub container_id: Option<String>,
    pub container_image: String,
    pub mock_sidecar_endpoint: Option<String>,
    pub inspect_eval_id: Option<String>,
    pub inspect_sample_id: Option<String>,
    pub scorer_results: Vec<ScorerResult>,
    pub usage: Usage,
}

impl CaseResult {
    /// The persisted `final_score`: arithmetic mean of scorer rows, or `None`
    /// when no scorer ran.
    pub fn final_score(&self) -> Option<f64> {
        if self.scorer_results.is_empty() {
            return None;
        }
        let sum: f64 = self.scorer_results.iter().map(|s| s.score).sum();
        Some(sum / self.scorer_results.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Failed,
    Timeout,
}

impl From<TerminalStatus> for CaseStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Success => CaseStatus::Success,
            TerminalStatus::Failed => CaseStatus::Failed,
            TerminalStatus::Timeout => CaseStatus::Timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerResult {
    pub scorer_name: String,
    pub score: f64,
    pub reason: String,
}

/// Phase timings and token counts accumulated while running a case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub pull_ms: Option<u64>,
    pub run_ms: Option<u64>,
    pub exec_ms: Option<u64>,
    pub scoring_ms: Option<u64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_accepts_pending_queued_and_trajectory() {
        assert!(CaseStatus::Running.can_transition_from(CaseStatus::Pending));
        assert!(CaseStatus::Running.can_transition_from(CaseStatus::Queued));
        assert!(CaseStatus::Running.can_transition_from(CaseStatus::Trajectory));
        assert!(!CaseStatus::Running.can_transition_from(CaseStatus::Scoring));
    }

    #[test]
    fn trajectory_scoring_cycle_is_bidirectional() {
        assert!(CaseStatus::Trajectory.can_transition_from(CaseStatus::Scoring));
        assert!(CaseStatus::Scoring.can_transition_from(CaseStatus::Trajectory));
    }

    #[test]
    fn terminal_states_reachable_from_any_non_terminal() {
        for from in [
            CaseStatus::Pending,
            CaseStatus::Queued,
            CaseStatus::Running,
            CaseStatus::Trajectory,
            CaseStatus::Scoring,
        ] {
            assert!(CaseStatus::Success.can_transition_from(from));
        }
        assert!(!CaseStatus::Success.can_transition_from(CaseStatus::Failed));
    }

    #[test]
    fn final_score_is_arithmetic_mean() {
        let mut result = sample_result();
        result.scorer_results = vec![
            ScorerResult { scorer_name: "a".into(), score: 1.0, reason: "ok".into() },
            ScorerResult { scorer_name: "b".into(), score: 0.5, reason: "ok".into() },
        ];
        assert_eq!(result.final_score(), Some(0.75));
    }

    #[test]
    fn final_score_is_none_when_no_scorers_ran() {
        assert_eq!(sample_result().final_score(), None);
    }

    fn sample_result() -> CaseResult {
        CaseResult {
            run_case_id: "case-1".into(),
            status: TerminalStatus::Success,
            trajectory: vec![],
            output: Value::Null,
            logs: String::new(),
            error_message: None,
            exit_code: Some(0),
            latency_ms: 0,
            container_id: None,
            container_image: "img".into(),
            mock_sidecar_endpoint: None,
            inspect_eval_id: None,
            inspect_sample_id: None,
            scorer_results: vec![],
            usage: Usage::default(),
        }
    }
}
