//! Error types for pipeline domain validation, parsing, and transitions.

use super::{Status, SubtaskKind, TaskKey};
use thiserror::Error;

/// Errors returned while constructing or mutating domain task values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskDomainError {
    /// The pipeline name is empty, too long, or contains whitespace.
    #[error("invalid pipeline name '{0}'")]
    InvalidPipelineName(String),

    /// The task number is zero or exceeds the persisted range.
    #[error("invalid task id {0}, expected a positive integer")]
    InvalidTaskId(u64),

    /// The task failed structural validation.
    #[error("invalid task: {0}")]
    InvalidTask(InvalidTaskReason),

    /// The task status transition is not permitted.
    #[error("illegal transition for task {key}: {from} -> {to}")]
    IllegalTransition {
        /// Task being transitioned.
        key: TaskKey,
        /// Current status.
        from: Status,
        /// Requested status.
        to: Status,
    },

    /// The subtask status transition is not permitted.
    #[error("illegal transition for subtask {index} ({kind}) of task {key}: {from} -> {to}")]
    IllegalSubtaskTransition {
        /// Owning task.
        key: TaskKey,
        /// Position of the subtask.
        index: usize,
        /// Subtask kind.
        kind: SubtaskKind,
        /// Current status.
        from: Status,
        /// Requested status.
        to: Status,
    },

    /// A subtask position does not exist in the task.
    #[error("task {key} has no subtask at index {index}")]
    SubtaskIndexOutOfRange {
        /// Owning task.
        key: TaskKey,
        /// Requested position.
        index: usize,
    },

    /// The subtask is disabled and can never run.
    #[error("subtask {index} of task {key} is disabled")]
    SubtaskDisabled {
        /// Owning task.
        key: TaskKey,
        /// Position of the subtask.
        index: usize,
    },
}

/// Reasons a task is rejected by structural validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidTaskReason {
    /// The task carries no subtasks.
    #[error("task has no subtasks")]
    NoSubtasks,

    /// A raw subtask has no `type` discriminator.
    #[error("subtask {index} has no type")]
    MissingSubtaskKind {
        /// Position of the subtask.
        index: usize,
    },

    /// A raw subtask names an unknown kind.
    #[error("subtask {index} has unknown type '{kind}'")]
    UnknownSubtaskKind {
        /// Position of the subtask.
        index: usize,
        /// Raw kind value.
        kind: String,
    },

    /// A raw subtask payload does not match its kind.
    #[error("subtask {index} ({kind}) is malformed: {reason}")]
    MalformedSubtask {
        /// Position of the subtask.
        index: usize,
        /// Declared kind.
        kind: SubtaskKind,
        /// Deserialisation failure.
        reason: String,
    },

    /// An enabled subtask has a zero timeout.
    #[error("enabled subtask {index} ({kind}) must have a positive timeout")]
    NonPositiveTimeout {
        /// Position of the subtask.
        index: usize,
        /// Subtask kind.
        kind: SubtaskKind,
    },
}

/// Error returned while parsing statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

/// Error returned while parsing subtask kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown subtask kind: {0}")]
pub struct ParseSubtaskKindError(pub String);

/// Error returned while parsing pipeline types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown pipeline type: {0}")]
pub struct ParsePipelineTypeError(pub String);
