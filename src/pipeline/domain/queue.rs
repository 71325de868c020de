//! Durable dispatch records mirroring a task's queue state.

use super::{TaskKey, WorkerId};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dispatch state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// Waiting for a worker to claim it.
    Pending,
    /// Claimed by a worker that has not started execution yet.
    Claimed,
    /// Being executed by the claiming worker.
    Running,
}

impl DispatchState {
    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
        }
    }

    /// Parses the storage representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            _ => None,
        }
    }
}

/// Queue entry for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    key: TaskKey,
    state: DispatchState,
    worker: Option<WorkerId>,
    lease_expires_at: Option<DateTime<Utc>>,
    cancel_requested: bool,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
}

/// Parameter object for reconstructing a persisted queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedQueueEntry {
    /// Task key.
    pub key: TaskKey,
    /// Dispatch state.
    pub state: DispatchState,
    /// Claiming worker, if any.
    pub worker: Option<WorkerId>,
    /// End of the current claim lease, if any.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
    /// Number of successful claims so far.
    pub attempts: u32,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Creates a pending entry.
    #[must_use]
    pub const fn pending(key: TaskKey, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            key,
            state: DispatchState::Pending,
            worker: None,
            lease_expires_at: None,
            cancel_requested: false,
            attempts: 0,
            enqueued_at,
        }
    }

    /// Reconstructs an entry from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedQueueEntry) -> Self {
        Self {
            key: data.key,
            state: data.state,
            worker: data.worker,
            lease_expires_at: data.lease_expires_at,
            cancel_requested: data.cancel_requested,
            attempts: data.attempts,
            enqueued_at: data.enqueued_at,
        }
    }

    /// Returns the task key.
    #[must_use]
    pub const fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Returns the dispatch state.
    #[must_use]
    pub const fn state(&self) -> DispatchState {
        self.state
    }

    /// Returns the claiming worker, if any.
    #[must_use]
    pub const fn worker(&self) -> Option<&WorkerId> {
        self.worker.as_ref()
    }

    /// Returns the end of the current lease, if claimed.
    #[must_use]
    pub const fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
    }

    /// Returns whether cancellation was requested.
    #[must_use]
    pub const fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Returns how many times the entry has been claimed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the enqueue timestamp.
    #[must_use]
    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Returns whether `worker` currently holds the claim.
    #[must_use]
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.state != DispatchState::Pending && self.worker.as_ref() == Some(worker)
    }

    /// Returns whether a held claim has outlived its lease at `now`.
    #[must_use]
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state != DispatchState::Pending
            && self.lease_expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Claims a pending entry. Returns `false` when it is already claimed.
    pub fn try_claim(&mut self, worker: &WorkerId, lease_expires_at: DateTime<Utc>) -> bool {
        if self.state != DispatchState::Pending {
            return false;
        }
        self.state = DispatchState::Claimed;
        self.worker = Some(worker.clone());
        self.lease_expires_at = Some(lease_expires_at);
        self.attempts = self.attempts.saturating_add(1);
        true
    }

    /// Marks a claimed entry as running. Returns `false` if not held by `worker`.
    pub fn mark_running(&mut self, worker: &WorkerId) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }
        self.state = DispatchState::Running;
        true
    }

    /// Extends the lease. Returns `false` if not held by `worker`.
    pub fn extend_lease(&mut self, worker: &WorkerId, lease_expires_at: DateTime<Utc>) -> bool {
        if !self.is_held_by(worker) {
            return false;
        }
        self.lease_expires_at = Some(lease_expires_at);
        true
    }

    /// Returns the entry to the pending state for redelivery.
    pub fn release(&mut self) {
        self.state = DispatchState::Pending;
        self.worker = None;
        self.lease_expires_at = None;
    }

    /// Raises the cancellation flag.
    pub const fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }
}

/// Message announcing a runnable task on the dispatch bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Task to claim.
    pub key: TaskKey,
    /// Delivery attempt, starting at 1.
    pub delivery: u32,
}

impl DispatchEvent {
    /// Creates a first-delivery event.
    #[must_use]
    pub const fn first(key: TaskKey) -> Self {
        Self { key, delivery: 1 }
    }

    /// Creates a redelivery event.
    #[must_use]
    pub const fn redelivery(key: TaskKey, delivery: u32) -> Self {
        Self { key, delivery }
    }
}

/// Computes the end of a lease starting at `now`, saturating on overflow.
#[must_use]
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
