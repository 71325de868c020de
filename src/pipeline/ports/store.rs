//! Document store ports for task documents and queue entries.

use crate::pipeline::domain::{PipelineName, QueueEntry, Task, TaskId, TaskKey, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Task document persistence contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocates the next task number for `pipeline`.
    ///
    /// Numbers are monotonic per pipeline name and start at 1.
    async fn next_task_id(&self, pipeline: &PipelineName) -> StoreResult<TaskId>;

    /// Stores a new task document and returns it stamped with version 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the key already exists.
    async fn insert_task(&self, task: &Task) -> StoreResult<Task>;

    /// Finds a task by key. Returns `None` when it does not exist.
    async fn find_task(&self, key: &TaskKey) -> StoreResult<Option<Task>>;

    /// Replaces a task document when its stored version still matches
    /// `task.version()`, returning the document with the bumped version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown keys and
    /// [`StoreError::VersionConflict`] when another writer got there first.
    async fn update_task(&self, task: &Task) -> StoreResult<Task>;
}

/// Queue entry persistence contract.
///
/// Every mutating operation is a single conditional update against the
/// store; none of them may be implemented as read-then-write.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Stores a new pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when an entry exists for the key.
    async fn insert_entry(&self, entry: &QueueEntry) -> StoreResult<()>;

    /// Finds the entry for a key.
    async fn find_entry(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>>;

    /// Atomically claims a pending entry for `worker`.
    ///
    /// Returns `None` when the entry is missing or already claimed.
    async fn try_claim(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Marks a claimed entry as running.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ClaimLost`] when `worker` no longer holds it.
    async fn mark_running(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry>;

    /// Extends the lease held by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ClaimLost`] when `worker` no longer holds it.
    async fn heartbeat(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<QueueEntry>;

    /// Returns claimed or running entries whose lease ended before `now`.
    async fn expired_claims(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueueEntry>>;

    /// Returns an entry to pending when its lease ended before `now`.
    ///
    /// Returns `None` when the entry was renewed or released concurrently.
    async fn release_expired(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Returns an entry held by `worker` to pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ClaimLost`] when `worker` no longer holds it.
    async fn release(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry>;

    /// Raises the cancellation flag of an entry.
    ///
    /// Returns `None` when no entry exists (the task already finished).
    async fn request_cancel(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>>;

    /// Deletes the entry once its task is terminal.
    async fn remove_entry(&self, key: &TaskKey) -> StoreResult<()>;
}

/// Errors returned by store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A record with the same key already exists.
    #[error("duplicate record: {0}")]
    Duplicate(TaskKey),

    /// The record was not found.
    #[error("record not found: {0}")]
    NotFound(TaskKey),

    /// The stored version differs from the expected one.
    #[error("version conflict on {key}: expected {expected}")]
    VersionConflict {
        /// Task key.
        key: TaskKey,
        /// Version the writer started from.
        expected: u64,
    },

    /// The caller no longer holds the claim.
    #[error("claim on {key} is not held by {worker}")]
    ClaimLost {
        /// Task key.
        key: TaskKey,
        /// Worker that expected to hold the claim.
        worker: WorkerId,
    },

    /// The store could not be reached; retrying later may succeed.
    #[error("store unavailable: {0}")]
    Unavailable(Arc<dyn std::error::Error + Send + Sync>),

    /// Persistence-layer failure that a retry will not fix.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }

    /// Wraps a connectivity error.
    pub fn unavailable(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unavailable(Arc::new(err))
    }

    /// Returns whether retrying the operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
