//! Arbitrage detection and execution.
//!
//! Contains the core logic for:
//! - Fee-aware opportunity detection across sources
//! - The per-item execution state machine with compensation
//! - Retry and backoff for trading calls
//! - Wiring feeds through detection into execution

pub mod attempt;
mod coordinator;
mod detector;
mod fees;
mod pipeline;
mod retry;

pub use attempt::{AttemptState, ExecutionAttempt, InvalidTransition};
pub use coordinator::{ExecutionCoordinator, ExecutionError, ExecutionOutcome, ExecutionReport};
pub use detector::OpportunityDetector;
pub use fees::FeeSchedule;
pub use pipeline::{ArbitragePipeline, PipelineSnapshot, PipelineStats};
pub use retry::RetryPolicy;
