//! Job lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not yet attempted.
    Pending,
    /// Admission was denied at least once; waiting for the next pass.
    Queued,
    /// Bound to a device with an active runner.
    Running,
    /// Finished successfully.
    Completed,
    /// Runner or precondition error.
    Failed,
    /// Cancelled by its owner.
    Stopped,
}

impl JobState {
    /// Checks if a job can move from this state to `to`.
    ///
    /// # Arguments
    /// * `to` - The target state
    ///
    /// # Returns
    /// Returns `true` if the transition is valid, `false` otherwise.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct state transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // Admission denied: Pending moves to Queued, Queued stays Queued
            (Self::Pending | Self::Queued, Self::Queued) => true,
            // Admission granted
            (Self::Pending | Self::Queued, Self::Running) => true,
            // Cancelled or failed a precondition before starting
            (Self::Pending | Self::Queued, Self::Stopped | Self::Failed) => true,
            // Runner reported a terminal result
            (Self::Running, Self::Completed | Self::Failed | Self::Stopped) => true,
            // Everything else, including leaving a terminal state
            _ => false,
        }
    }

    /// `Completed`, `Failed` and `Stopped` are terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Waiting for admission.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
