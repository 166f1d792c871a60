//! Error taxonomy for the benchmark worker.
//!
//! Every fallible operation in the core pipeline returns a [`WorkerError`].
//! Variants group by the families laid out in the error-handling design:
//! message rejection, per-case sandbox failure, message-level retry
//! exhaustion, scorer sentinels, and mock/collector infrastructure errors.
//! The `Display` impl always renders as `E_CODE: detail` so log lines and
//! persisted reason strings keep the original error codes.

use std::fmt;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("E_UNSUPPORTED_MESSAGE_TYPE: {0}")]
    UnsupportedMessageType(String),

    #[error("E_UNSUPPORTED_SCHEMA_VERSION: {0}")]
    UnsupportedSchemaVersion(String),

    #[error("E_RUNTIME_SPEC_IMAGE_REQUIRED: agent_image must be non-empty")]
    RuntimeSpecImageRequired,

    #[error("E_RUNTIME_SPEC_CASE_EXEC_REQUIRED: case_exec_command must be non-empty")]
    RuntimeSpecCaseExecRequired,

    #[error("E_DOCKER_PULL: {0}")]
    DockerPull(String),

    #[error("E_DOCKER_CREATE: {0}")]
    DockerCreate(String),

    #[error("E_DOCKER_WAIT: {0}")]
    DockerWait(String),

    #[error("E_DOCKER_LOGS: {0}")]
    DockerLogs(String),

    #[error("E_DOCKER_EXEC_TIMEOUT: {0}")]
    DockerExecTimeout(String),

    #[error("E_CONTAINER_STARTUP_TIMEOUT: {0}")]
    ContainerStartupTimeout(String),

    #[error("E_CASE_EXEC_NON_ZERO: exit code {0}")]
    CaseExecNonZero(i64),

    #[error("E_RUN_ATTEMPT_FAILED: {0}")]
    RunAttemptFailed(String),

    #[error("E_RUN_RETRIES_EXCEEDED: {failures}/{total} run cases failed after {attempts} attempts")]
    RunRetriesExceeded {
        failures: usize,
        total: usize,
        attempts: u32,
    },

    #[error("E_MOCK_GATEWAY_CONFIG_CONFLICT: concurrent mock sidecar start with differing config for key {0}")]
    MockGatewayConfigConflict(String),

    #[error("E_OTEL_COLLECTOR_PORT_IN_USE: {0}")]
    OtelCollectorPortInUse(String),

    #[error("E_UNSUPPORTED_DATABASE_ENGINE: {0}")]
    UnsupportedDatabaseEngine(String),

    #[error("E_ACK_FAILED: {0}")]
    AckFailed(String),

    #[error("E_NACK_FAILED: {0}")]
    NackFailed(String),

    #[error("E_MQ_CONNECTION_LOST: {0}")]
    MqConnectionLost(String),

    #[error("E_MESSAGE_PROCESS: {0}")]
    MessageProcess(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scorer sentinel reason codes. These never propagate as errors; they are
/// stored verbatim as the `reason` column of a scorer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSentinelReason {
    RunCaseFailed,
    ScorerTimeout,
    EmptyContent,
    InvalidJson,
    ScoreInvalid,
}

impl ScoreSentinelReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::RunCaseFailed => "E_SCORE_DEFAULT_RUN_CASE_FAILED",
            Self::ScorerTimeout => "E_SCORE_DEFAULT_SCORER_TIMEOUT",
            Self::EmptyContent => "E_EVALUATOR_EMPTY_CONTENT",
            Self::InvalidJson => "E_EVALUATOR_INVALID_JSON",
            Self::ScoreInvalid => "E_EVALUATOR_SCORE_INVALID",
        }
    }
}

impl fmt::Display for ScoreSentinelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_preserves_codes() {
        let err = WorkerError::CaseExecNonZero(7);
        assert_eq!(err.to_string(), "E_CASE_EXEC_NON_ZERO: exit code 7");
    }

    #[test]
    fn sentinel_reason_codes_match_taxonomy() {
        assert_eq!(
            ScoreSentinelReason::RunCaseFailed.code(),
            "E_SCORE_DEFAULT_RUN_CASE_FAILED"
        );
        assert_eq!(
            ScoreSentinelReason::ScorerTimeout.to_string(),
            "E_SCORE_DEFAULT_SCORER_TIMEOUT"
        );
    }
}
