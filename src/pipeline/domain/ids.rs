//! Identifier and validated scalar types for the pipeline domain.

use super::TaskDomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum pipeline name length accepted at submission time.
const MAX_PIPELINE_NAME_LENGTH: usize = 255;

/// Validated pipeline (workflow) name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    /// Creates a validated pipeline name.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidPipelineName`] when the trimmed value
    /// is empty, contains whitespace, or exceeds 255 characters.
    pub fn new(value: impl Into<String>) -> Result<Self, TaskDomainError> {
        let raw = value.into();
        let trimmed = raw.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_PIPELINE_NAME_LENGTH
            && !trimmed.chars().any(char::is_whitespace);
        if !is_valid {
            return Err(TaskDomainError::InvalidPipelineName(raw));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the pipeline name as `str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PipelineName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Positive task number, monotonic within one pipeline name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Largest task number representable in the `PostgreSQL` schema.
    const MAX_PERSISTED_VALUE: u64 = i64::MAX.unsigned_abs();

    /// Creates a validated task number.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTaskId`] when the value is zero or
    /// exceeds `i64::MAX`.
    pub const fn new(value: u64) -> Result<Self, TaskDomainError> {
        if value == 0 || value > Self::MAX_PERSISTED_VALUE {
            return Err(TaskDomainError::InvalidTaskId(value));
        }
        Ok(Self(value))
    }

    /// Returns the underlying numeric value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-lookup key for a task: `(pipeline name, task ID)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pipeline_name: PipelineName,
    task_id: TaskId,
}

impl TaskKey {
    /// Creates a task key from validated parts.
    #[must_use]
    pub const fn new(pipeline_name: PipelineName, task_id: TaskId) -> Self {
        Self {
            pipeline_name,
            task_id,
        }
    }

    /// Creates a task key from raw values.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskDomainError`] when either component is invalid.
    pub fn from_parts(pipeline_name: &str, task_id: u64) -> Result<Self, TaskDomainError> {
        Ok(Self::new(PipelineName::new(pipeline_name)?, TaskId::new(task_id)?))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub const fn pipeline_name(&self) -> &PipelineName {
        &self.pipeline_name
    }

    /// Returns the task number.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pipeline_name, self.task_id)
    }
}

/// Identity of a dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a worker identifier from an existing name.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates a random worker identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4().simple()))
    }

    /// Returns the identifier as `str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a target Kubernetes cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    /// Creates a cluster identifier.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the identifier as `str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
