//! Redis-backed idempotency gate.
//!
//! Two markers per message fingerprint: an in-flight `processing` key with a
//! short TTL acquired via `SET NX EX`, and a long-lived `processed` key
//! written only after the message has fully run. `already_processed` is
//! always checked before `acquire_processing` so that a completed message
//! delivered again is never resurrected into a fresh processing attempt.

use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::RedisSettings;

pub struct IdempotencyGate {
    client: redis::Client,
    processing_ttl_seconds: u64,
    processed_ttl_seconds: u64,
}

impl IdempotencyGate {
    pub fn from_settings(settings: &RedisSettings) -> anyhow::Result<Self> {
        let mut url = format!("redis://{}:{}/{}", settings.host, settings.port, settings.db);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            url = format!("redis://{user}:{pass}@{}:{}/{}", settings.host, settings.port, settings.db);
        }
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            processing_ttl_seconds: settings.processing_lock_ttl_seconds,
            processed_ttl_seconds: settings.processed_ttl_seconds,
        })
    }

    /// Returns `message_id` verbatim if non-empty, else a SHA-256 hash of the payload.
    pub fn suffix(message_id: &str, payload: &[u8]) -> String {
        if !message_id.is_empty() {
            return message_id.to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(payload);
        format!("{:x}", hasher.finalize())
    }

    fn processing_key(suffix: &str) -> String {
        format!("benchmark:consumer:processing:{suffix}")
    }

    fn processed_key(suffix: &str) -> String {
        format!("benchmark:consumer:processed:{suffix}")
    }

    pub async fn already_processed(&self, suffix: &str) -> anyhow::Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.exists(Self::processed_key(suffix)).await?;
        if exists {
            info!(code = "E_DUPLICATE_MESSAGE_PROCESSED", suffix, "message already processed");
        }
        Ok(exists)
    }

    /// Atomic compare-and-set with TTL. `false` means another worker holds the lock.
    pub async fn acquire_processing(&self, suffix: &str) -> anyhow::Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let acquired: bool = redis::cmd("SET")
            .arg(Self::processing_key(suffix))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.processing_ttl_seconds)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !acquired {
            info!(code = "E_DUPLICATE_MESSAGE_PROCESSING", suffix, "message already in flight");
        }
        Ok(acquired)
    }

    pub async fn mark_processed(&self, suffix: &str) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set_ex(Self::processed_key(suffix), 1, self.processed_ttl_seconds)
            .await?;
        Ok(())
    }

    pub async fn release_processing(&self, suffix: &str) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(Self::processing_key(suffix)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_prefers_message_id() {
        assert_eq!(IdempotencyGate::suffix("msg-1", b"ignored"), "msg-1");
    }

    #[test]
    fn suffix_hashes_payload_when_message_id_empty() {
        let a = IdempotencyGate::suffix("", b"payload-a");
        let b = IdempotencyGate::suffix("", b"payload-b");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_naming_matches_namespace_convention() {
        assert_eq!(
            IdempotencyGate::processing_key("abc"),
            "benchmark:consumer:processing:abc"
        );
        assert_eq!(
            IdempotencyGate::processed_key("abc"),
            "benchmark:consumer:processed:abc"
        );
    }
}
