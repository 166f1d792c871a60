//! # benchmark-worker
//!
//! Queue-driven benchmark execution worker.
//!
//! A message on the experiment queue names a batch of run cases against one
//! agent image and a set of scorers. For each case this worker:
//!
//! 1. optionally starts a per-case mock HTTP sidecar ([`mock_sidecar`])
//! 2. pulls and starts the agent container ([`sandbox`])
//! 3. executes the case command and parses its output
//! 4. resolves a trajectory from OTLP spans/logs, falling back through the
//!    repository when the in-memory collector has nothing ([`trajectory`])
//! 5. scores the result against each configured evaluator backend
//!    ([`scorer`])
//! 6. persists the result and reconciles the owning experiment's aggregate
//!    status ([`repository`], [`reconciler`])
//!
//! [`runner::CaseRunner`] drives steps 1-5 for one case; [`scheduler::Scheduler`]
//! fans a message's cases out across a bounded pool and retries message-level
//! failures; [`ingest::Ingestor`] is the RabbitMQ consumer loop that feeds it,
//! gated by [`gate::IdempotencyGate`] for at-least-once delivery safety.

pub mod config;
pub mod domain;
pub mod error;
pub mod gate;
pub mod ingest;
pub mod mock_sidecar;
pub mod otel_collector;
pub mod parser;
pub mod reconciler;
pub mod repository;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod scorer;
pub mod trajectory;

pub use config::Settings;
pub use error::{WorkerError, WorkerResult};
pub use ingest::Ingestor;
pub use otel_collector::OtlpCollector;
pub use repository::Repository;
pub use runner::CaseRunner;
pub use scheduler::Scheduler;
