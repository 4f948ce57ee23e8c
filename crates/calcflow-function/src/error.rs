//! Error types for function resolution.

use calcflow_core::FunctionId;
use thiserror::Error;

/// Result type alias for resolver operations.
pub type ResolutionResult<T> = Result<T, ResolutionError>;

/// Configuration errors surfaced while resolving.
///
/// A requirement nothing can satisfy is not an error; resolution returns an
/// empty candidate iterator instead.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Two rules at the same priority cannot be told apart.
    #[error("ambiguous rules at priority {priority} for {target}: {function_id} registered twice with identical parameters")]
    AmbiguousPriority {
        priority: i32,
        function_id: FunctionId,
        target: String,
    },
}
