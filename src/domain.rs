//! Core domain types shared across the pipeline: the inbound message shape,
//! the case state machine, and normalized OTLP records.

pub mod case;
pub mod message;
pub mod otel;

pub use case::{CaseResult, CaseStatus, ScorerResult, TerminalStatus, Usage};
pub use message::{Agent, Dataset, Experiment, Message, RunCase, RuntimeSpec, Scorer};
pub use otel::{AttributeValue, LogRecord, Scope, SpanRecord, SpanStatus};
