//! Cycle and node states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a computation cycle.
///
/// ```text
/// AwaitingExecution -> Executing -> Executed | ExecutionInterrupted -> Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewCycleState {
    AwaitingExecution,
    Executing,
    Executed,
    ExecutionInterrupted,
    Destroyed,
}

impl ViewCycleState {
    /// States in which the cycle's caches may be queried.
    pub fn has_caches(self) -> bool {
        matches!(
            self,
            Self::Executing | Self::Executed | Self::ExecutionInterrupted
        )
    }
}

impl fmt::Display for ViewCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::AwaitingExecution => "AWAITING_EXECUTION",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::ExecutionInterrupted => "EXECUTION_INTERRUPTED",
            Self::Destroyed => "DESTROYED",
        };
        write!(f, "{label}")
    }
}

/// Execution state of one node within one cycle. Absent means not yet run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStateFlag {
    Executed,
    Failed,
    Suppressed,
}
