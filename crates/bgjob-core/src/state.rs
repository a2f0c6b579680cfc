//! Job lifecycle states.
//!
//! ```text
//!               ┌───────────┐
//!         ┌────▶│  Stopped  │  worker completed and sent a completion frame
//!         │     └───────────┘
//! ┌───────┴─┐   ┌───────────┐
//! │ Running │──▶│ Canceled  │  cancellation acknowledged before completion
//! └───────┬─┘   └───────────┘
//!         │     ┌───────────┐
//!         └────▶│   Error   │  worker sent an error frame, or the segment
//!               └───────────┘  became unreachable before completion
//! ```
//!
//! All three right-hand states are terminal; nothing re-enters `Running`.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a launched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The worker is (or is presumed to be) executing the job.
    Running,
    /// The worker completed the job.
    Stopped,
    /// A cancellation request was acknowledged before completion.
    Canceled,
    /// The job failed, or the worker was lost mid-stream.
    Error,
}

impl JobState {
    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a transition from `self` to `to` is legal.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(self, Self::Running) && to.is_terminal()
    }

    /// Encode for the segment's final-state cell. Zero means "running",
    /// which is also the cell's zero-initialized value.
    #[must_use]
    pub const fn to_cell(self) -> u32 {
        match self {
            Self::Running => 0,
            Self::Stopped => 1,
            Self::Canceled => 2,
            Self::Error => 3,
        }
    }

    /// Decode from the segment's final-state cell.
    #[must_use]
    pub const fn from_cell(cell: u32) -> Option<Self> {
        match cell {
            0 => Some(Self::Running),
            1 => Some(Self::Stopped),
            2 => Some(Self::Canceled),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Short name for logs and snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
