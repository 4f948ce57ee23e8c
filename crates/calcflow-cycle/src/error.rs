//! Error types for computation cycles.
//!
//! Only caller misuse, interruption and I/O surface as errors. Failed nodes,
//! missing market data and suppression are recorded as data in the caches and
//! the result model.

use thiserror::Error;

use crate::state::ViewCycleState;

/// Result type alias for cycle operations.
pub type CycleResult<T> = Result<T, CycleError>;

/// Errors that can occur while driving a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The operation is not valid in the cycle's current state.
    #[error("cannot {operation} a cycle in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ViewCycleState,
    },

    /// `execute` was already called on this cycle.
    #[error("cycle has already been executed")]
    AlreadyExecuted,

    /// `release` was already called on this cycle.
    #[error("cycle has already been released")]
    AlreadyReleased,

    /// The previous cycle supplied for delta reuse did not complete.
    #[error("previous cycle must be EXECUTED for delta reuse, found {state}")]
    PreviousCycleNotExecuted { state: ViewCycleState },

    /// A query named a calculation configuration the view does not have.
    #[error("unknown calculation configuration: {name}")]
    UnknownCalculationConfiguration { name: String },

    /// Execution was interrupted; outstanding jobs were cancelled.
    #[error("cycle execution interrupted")]
    Interrupted,

    /// Cache dump serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (cache dumps).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
