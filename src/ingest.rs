//! RabbitMQ consumer: reconnects with backoff, enforces ack/nack discipline,
//! and gates every message through [`crate::gate::IdempotencyGate`] before
//! handing it to the [`crate::scheduler::Scheduler`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{WorkerError, WorkerResult};
use crate::gate::IdempotencyGate;
use crate::parser;
use crate::scheduler::Scheduler;

const RECONNECT_BACKOFF_SECONDS: u64 = 5;

pub struct Ingestor {
    settings: Arc<Settings>,
    gate: Arc<IdempotencyGate>,
    scheduler: Arc<Scheduler>,
}

impl Ingestor {
    pub fn new(settings: Arc<Settings>, gate: Arc<IdempotencyGate>, scheduler: Arc<Scheduler>) -> Self {
        Self { settings, gate, scheduler }
    }

    /// Runs forever, reconnecting on connection loss. Returns only if
    /// `shutdown` resolves.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> WorkerResult<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping ingestion");
                    return Ok(());
                }
                result = self.run_once() => {
                    match result {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            error!(error = %e, "ingest connection lost, reconnecting");
                            tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_SECONDS)).await;
                        }
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> WorkerResult<()> {
        let conn = Connection::connect(&self.settings.rabbitmq.url(), ConnectionProperties::default())
            .await
            .map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;
        let channel = conn.create_channel().await.map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;

        channel
            .basic_qos(self.settings.concurrent_cases.max(1) as u16, BasicQosOptions::default())
            .await
            .map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;

        channel
            .queue_declare(
                &self.settings.rabbitmq.experiment_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;

        let mut consumer = channel
            .basic_consume(
                &self.settings.rabbitmq.experiment_queue,
                "benchmark-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;

        info!(queue = %self.settings.rabbitmq.experiment_queue, "ingestion consuming");

        while let Some(delivery) = consumer.next().await {
            let delivery = delivery.map_err(|e| WorkerError::MqConnectionLost(e.to_string()))?;
            self.handle_delivery(&channel, delivery.delivery_tag, &delivery.data).await;
        }

        Err(WorkerError::MqConnectionLost("consumer stream ended".to_string()))
    }

    async fn handle_delivery(&self, channel: &Channel, delivery_tag: u64, payload: &[u8]) {
        match self.process_payload(payload).await {
            Ok(()) => {
                if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                    error!(error = %e, delivery_tag, "E_ACK_FAILED");
                }
            }
            Err(ProcessOutcome::Skip) => {
                if let Err(e) = channel.basic_ack(delivery_tag, BasicAckOptions::default()).await {
                    error!(error = %e, delivery_tag, "E_ACK_FAILED");
                }
            }
            Err(ProcessOutcome::Reject(e)) => {
                warn!(error = %e, delivery_tag, "message processing failed, rejecting without requeue");
                if let Err(nack_err) = channel
                    .basic_nack(delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
                    .await
                {
                    error!(error = %nack_err, delivery_tag, "E_NACK_FAILED");
                }
            }
        }
    }

    async fn process_payload(&self, payload: &[u8]) -> Result<(), ProcessOutcome> {
        let message = parser::parse_and_validate(payload).map_err(|e| ProcessOutcome::Reject(e.to_string()))?;
        let suffix = IdempotencyGate::suffix(&message.message_id, payload);

        let already_processed = self
            .gate
            .already_processed(&suffix)
            .await
            .map_err(|e| ProcessOutcome::Reject(e.to_string()))?;
        if already_processed {
            return Err(ProcessOutcome::Skip);
        }

        let acquired = self
            .gate
            .acquire_processing(&suffix)
            .await
            .map_err(|e| ProcessOutcome::Reject(e.to_string()))?;
        if !acquired {
            return Err(ProcessOutcome::Skip);
        }

        let result = self.scheduler.process(&message).await;

        match result {
            Ok(()) => {
                if let Err(e) = self.gate.mark_processed(&suffix).await {
                    warn!(error = %e, suffix, "failed to mark message processed");
                }
                if let Err(e) = self.gate.release_processing(&suffix).await {
                    warn!(error = %e, suffix, "failed to release processing lock");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(release_err) = self.gate.release_processing(&suffix).await {
                    warn!(error = %release_err, suffix, "failed to release processing lock after failure");
                }
                Err(ProcessOutcome::Reject(WorkerError::MessageProcess(e.to_string()).to_string()))
            }
        }
    }
}

enum ProcessOutcome {
    Skip,
    Reject(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_backoff_is_positive() {
        assert!(RECONNECT_BACKOFF_SECONDS > 0);
    }
}
