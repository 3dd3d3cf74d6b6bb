//! Kernel error kinds.
//!
//! Tool failures are never errors — they are reified into
//! [`crate::tools::registry::ToolExecution`] values and flow to the
//! finalizer. Only `Cancelled` and `Fatal` terminate a turn early.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrainError {
    /// Bad plan JSON or missing required input; recovered by reprompting.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Static plan verification failed and policy is hard-fail.
    #[error("plan validation failed: {0:?}")]
    PlanValidation(Vec<String>),

    /// The active turn was cancelled (barge-in or user cancel).
    #[error("turn cancelled")]
    Cancelled,

    /// Registry mis-configured or unrecoverable I/O. Surfaced to the caller;
    /// the session may continue with the next turn.
    #[error("fatal: {0}")]
    Fatal(String),
}
