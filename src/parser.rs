//! Parses and validates raw broker payloads into [`Message`] values.

use crate::domain::Message;
use crate::domain::message::{SUPPORTED_MESSAGE_TYPE, SUPPORTED_SCHEMA_VERSION};
use crate::error::{WorkerError, WorkerResult};

/// Parses `payload` as JSON and rejects unsupported message types/schema
/// versions before returning. This runs before any side effect — the
/// idempotency gate is only consulted for messages that pass here.
pub fn parse_and_validate(payload: &[u8]) -> WorkerResult<Message> {
    let message: Message = serde_json::from_slice(payload)
        .map_err(|e| WorkerError::Other(anyhow::anyhow!("malformed message payload: {e}")))?;

    if message.message_type != SUPPORTED_MESSAGE_TYPE {
        return Err(WorkerError::UnsupportedMessageType(message.message_type));
    }
    if message.schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(WorkerError::UnsupportedSchemaVersion(message.schema_version));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_payload() -> serde_json::Value {
        serde_json::json!({
            "message_id": "m-1",
            "message_type": "experiment.run.requested",
            "schema_version": "1.0",
            "experiment": {"id": "exp-1"},
            "dataset": {"id": "ds-1"},
            "agent": {"id": "agent-1", "runtime_spec": {"agent_image": "img:latest"}},
            "run_cases": [],
        })
    }

    #[test]
    fn accepts_supported_message() {
        let payload = base_payload();
        let parsed = parse_and_validate(payload.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.message_id, "m-1");
    }

    #[test]
    fn rejects_unsupported_message_type() {
        let mut payload = base_payload();
        payload["message_type"] = serde_json::json!("experiment.run.cancelled");
        let err = parse_and_validate(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedMessageType(_)));
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let mut payload = base_payload();
        payload["schema_version"] = serde_json::json!("2.0");
        let err = parse_and_validate(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedSchemaVersion(_)));
    }
}
