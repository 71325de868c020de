//! Status values and the transition table shared by tasks and subtasks.

use super::ParseStatusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status of a task or of one of its subtasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted but not yet handed to the dispatch queue.
    #[default]
    Created,
    /// Waiting in the dispatch queue (or re-queued after a lost claim).
    Queued,
    /// Waiting for a resource before it can be queued.
    Waiting,
    /// Waiting on an external approval.
    Blocked,
    /// Executing.
    Running,
    /// Finished successfully.
    Passed,
    /// Finished unsuccessfully.
    Failed,
    /// Exceeded its wall-clock budget.
    Timeout,
    /// Stopped by an explicit cancellation request.
    Cancelled,
    /// Not executed: disabled, or a previous step failed.
    Skipped,
}

impl Status {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Created,
        Self::Queued,
        Self::Waiting,
        Self::Blocked,
        Self::Running,
        Self::Passed,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
        Self::Skipped,
    ];

    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    /// Returns whether no further transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Timeout | Self::Cancelled | Self::Skipped
        )
    }

    /// Returns whether this is an unsuccessful outcome.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Cancelled)
    }

    /// Returns whether this status counts as success when aggregating.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Passed | Self::Skipped)
    }

    /// Returns whether transition to `target` is allowed.
    ///
    /// `Running -> Queued` is the re-queue edge used when a claim is lost
    /// and the work is handed to another worker.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(target, Self::Cancelled) {
            return true;
        }
        matches!(
            (self, target),
            (
                Self::Created,
                Self::Queued | Self::Waiting | Self::Blocked | Self::Running | Self::Skipped
            ) | (
                Self::Queued | Self::Waiting,
                Self::Blocked | Self::Running | Self::Skipped
            ) | (Self::Waiting, Self::Queued)
                | (Self::Blocked, Self::Running | Self::Failed | Self::Skipped)
                | (
                    Self::Running,
                    Self::Passed | Self::Failed | Self::Timeout | Self::Queued
                )
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Status {
    type Error = ParseStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseStatusError(value.to_owned()))
    }
}

/// Aggregates subtask statuses into a task status.
///
/// The result is the status of the first subtask that is neither `Passed`
/// nor `Skipped`, or `Passed` when every subtask is one of those two.
#[must_use]
pub fn aggregate_status(statuses: impl IntoIterator<Item = Status>) -> Status {
    statuses
        .into_iter()
        .find(|status| !status.is_success())
        .unwrap_or(Status::Passed)
}
