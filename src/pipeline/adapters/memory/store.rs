//! In-memory task and queue store for tests and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::pipeline::{
    domain::{PipelineName, QueueEntry, Task, TaskId, TaskKey, WorkerId},
    ports::{QueueStore, StoreError, StoreResult, TaskStore},
};

/// Thread-safe in-memory document store.
///
/// All conditional updates run under a single write lock, which makes them
/// atomic with respect to each other.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPipelineStore {
    state: Arc<RwLock<InMemoryStoreState>>,
}

#[derive(Debug, Default)]
struct InMemoryStoreState {
    tasks: HashMap<TaskKey, Task>,
    entries: HashMap<TaskKey, QueueEntry>,
    counters: HashMap<PipelineName, u64>,
}

impl InMemoryPipelineStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, InMemoryStoreState>> {
        self.state
            .read()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, InMemoryStoreState>> {
        self.state
            .write()
            .map_err(|err| StoreError::persistence(std::io::Error::other(err.to_string())))
    }
}

fn claim_lost(key: &TaskKey, worker: &WorkerId) -> StoreError {
    StoreError::ClaimLost {
        key: key.clone(),
        worker: worker.clone(),
    }
}

#[async_trait]
impl TaskStore for InMemoryPipelineStore {
    async fn next_task_id(&self, pipeline: &PipelineName) -> StoreResult<TaskId> {
        let mut state = self.write()?;
        let counter = state.counters.entry(pipeline.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        TaskId::new(*counter).map_err(StoreError::persistence)
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<Task> {
        let mut state = self.write()?;
        if state.tasks.contains_key(task.key()) {
            return Err(StoreError::Duplicate(task.key().clone()));
        }
        let stored = task.clone().with_version(1);
        state.tasks.insert(task.key().clone(), stored.clone());
        Ok(stored)
    }

    async fn find_task(&self, key: &TaskKey) -> StoreResult<Option<Task>> {
        let state = self.read()?;
        Ok(state.tasks.get(key).cloned())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let mut state = self.write()?;
        let current = state
            .tasks
            .get_mut(task.key())
            .ok_or_else(|| StoreError::NotFound(task.key().clone()))?;
        if current.version() != task.version() {
            return Err(StoreError::VersionConflict {
                key: task.key().clone(),
                expected: task.version(),
            });
        }
        let stored = task.clone().with_version(task.version().saturating_add(1));
        *current = stored.clone();
        Ok(stored)
    }
}

#[async_trait]
impl QueueStore for InMemoryPipelineStore {
    async fn insert_entry(&self, entry: &QueueEntry) -> StoreResult<()> {
        let mut state = self.write()?;
        if state.entries.contains_key(entry.key()) {
            return Err(StoreError::Duplicate(entry.key().clone()));
        }
        state.entries.insert(entry.key().clone(), entry.clone());
        Ok(())
    }

    async fn find_entry(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>> {
        let state = self.read()?;
        Ok(state.entries.get(key).cloned())
    }

    async fn try_claim(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.write()?;
        let claimed = state
            .entries
            .get_mut(key)
            .and_then(|entry| {
                entry
                    .try_claim(worker, lease_expires_at)
                    .then(|| entry.clone())
            });
        Ok(claimed)
    }

    async fn mark_running(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry> {
        let mut state = self.write()?;
        state
            .entries
            .get_mut(key)
            .and_then(|entry| entry.mark_running(worker).then(|| entry.clone()))
            .ok_or_else(|| claim_lost(key, worker))
    }

    async fn heartbeat(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let mut state = self.write()?;
        state
            .entries
            .get_mut(key)
            .and_then(|entry| {
                entry
                    .extend_lease(worker, lease_expires_at)
                    .then(|| entry.clone())
            })
            .ok_or_else(|| claim_lost(key, worker))
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueueEntry>> {
        let state = self.read()?;
        let mut expired: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|entry| entry.is_lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(QueueEntry::enqueued_at);
        Ok(expired)
    }

    async fn release_expired(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.write()?;
        let released = state
            .entries
            .get_mut(key)
            .filter(|entry| entry.is_lease_expired(now))
            .map(|entry| {
                entry.release();
                entry.clone()
            });
        Ok(released)
    }

    async fn release(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry> {
        let mut state = self.write()?;
        state
            .entries
            .get_mut(key)
            .filter(|entry| entry.is_held_by(worker))
            .map(|entry| {
                entry.release();
                entry.clone()
            })
            .ok_or_else(|| claim_lost(key, worker))
    }

    async fn request_cancel(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>> {
        let mut state = self.write()?;
        let flagged = state.entries.get_mut(key).map(|entry| {
            entry.request_cancel();
            entry.clone()
        });
        Ok(flagged)
    }

    async fn remove_entry(&self, key: &TaskKey) -> StoreResult<()> {
        let mut state = self.write()?;
        state.entries.remove(key);
        Ok(())
    }
}
