//! Queue and dispatch service: durable enqueue and exclusive claims.

use crate::config::EngineConfig;
use crate::pipeline::{
    domain::{
        DispatchEvent, DispatchState, PipelineName, QueueEntry, Status, Subtask, Task,
        TaskDomainError, TaskDraft, TaskKey, WorkerId, lease_deadline,
    },
    ports::{
        BusError, ClusterRegistry, DispatchBus, QueueStore, StoreError, StoreResult, TaskStore,
    },
};
use mockable::Clock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Service-level errors for queue and dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Domain validation failed.
    #[error(transparent)]
    Domain(#[from] TaskDomainError),

    /// A different task definition is already stored under the key.
    #[error("task {0} was already enqueued with a different definition")]
    DuplicateTask(TaskKey),

    /// The task is not claimable by this worker.
    #[error("no claimable work for {0}")]
    NoWork(TaskKey),

    /// The task does not exist.
    #[error("task {0} not found")]
    TaskNotFound(TaskKey),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Lease and back-off settings for the dispatch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Lease granted by a claim or heartbeat.
    pub lease_window: Duration,
    /// First back-off after a transient store failure during claim.
    pub initial_backoff: Duration,
    /// Largest back-off.
    pub max_backoff: Duration,
    /// Retries before a transient failure is surfaced.
    pub max_retries: u32,
}

impl DispatchSettings {
    /// Derives settings from engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            lease_window: config.lease_window(),
            initial_backoff: config.claim_initial_backoff(),
            max_backoff: config.claim_max_backoff(),
            max_retries: config.claim_max_retries,
        }
    }
}

/// Task claimed by a worker, ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    /// Task document at claim time.
    pub task: Task,
    /// Claimed queue entry.
    pub entry: QueueEntry,
    /// Worker holding the claim.
    pub worker: WorkerId,
    /// Delivery attempt of the event that led to the claim.
    pub delivery: u32,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nobody held the task; it was cancelled directly.
    Cancelled,
    /// The claim holder was asked to stop.
    Requested,
    /// The task had already finished.
    AlreadyFinished(Status),
}

/// Queue and dispatch orchestration service.
pub struct DispatchService<C>
where
    C: Clock + Send + Sync,
{
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn QueueStore>,
    bus: Arc<dyn DispatchBus>,
    clusters: ClusterRegistry,
    clock: Arc<C>,
    settings: DispatchSettings,
}

impl<C> Clone for DispatchService<C>
where
    C: Clock + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            queue: Arc::clone(&self.queue),
            bus: Arc::clone(&self.bus),
            clusters: self.clusters.clone(),
            clock: Arc::clone(&self.clock),
            settings: self.settings,
        }
    }
}

impl<C> DispatchService<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a dispatch service.
    ///
    /// `clusters` is used to delete workloads left behind by a task that is
    /// cancelled while nobody holds it.
    #[must_use]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn QueueStore>,
        bus: Arc<dyn DispatchBus>,
        clusters: ClusterRegistry,
        clock: Arc<C>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            tasks,
            queue,
            bus,
            clusters,
            clock,
            settings,
        }
    }

    /// Returns the lease and back-off settings.
    #[must_use]
    pub const fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Allocates the next task key for a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] when the counter cannot be advanced.
    pub async fn allocate_task_key(&self, pipeline: &PipelineName) -> DispatchResult<TaskKey> {
        let task_id = self.tasks.next_task_id(pipeline).await?;
        Ok(TaskKey::new(pipeline.clone(), task_id))
    }

    /// Validates, persists, and announces a task.
    ///
    /// Submitting the same definition twice returns the existing key without
    /// creating a second queue entry. A resubmission also finishes an earlier
    /// enqueue that stored the task but failed before queueing it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Domain`] for invalid drafts,
    /// [`DispatchError::DuplicateTask`] when the key holds a different
    /// definition, and [`DispatchError::Store`] or [`DispatchError::Bus`]
    /// when infrastructure is unavailable.
    pub async fn enqueue(&self, draft: TaskDraft) -> DispatchResult<TaskKey> {
        let task = draft.into_task(&*self.clock)?;
        let stored = match self.tasks.insert_task(&task).await {
            Ok(stored) => stored,
            Err(StoreError::Duplicate(_)) => return self.resolve_resubmission(&task).await,
            Err(err) => return Err(err.into()),
        };
        self.admit(stored).await
    }

    /// Writes the pending queue entry, queues the task, and announces it.
    ///
    /// Safe to repeat for a task whose earlier admission stopped part way.
    async fn admit(&self, mut stored: Task) -> DispatchResult<TaskKey> {
        let key = stored.key().clone();
        let entry = QueueEntry::pending(key.clone(), self.clock.utc());
        match self.queue.insert_entry(&entry).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => debug!(task = %key, "queue entry already present"),
            Err(err) => return Err(err.into()),
        }

        if stored.status() == Status::Created {
            stored.transition_to(Status::Queued, &*self.clock)?;
            self.tasks.update_task(&stored).await?;
        }
        self.bus.publish(DispatchEvent::first(key.clone())).await?;
        info!(
            pipeline = %key.pipeline_name(),
            task_id = %key.task_id(),
            subtasks = stored.subtasks().len(),
            "task enqueued"
        );
        Ok(key)
    }

    async fn resolve_resubmission(&self, task: &Task) -> DispatchResult<TaskKey> {
        let key = task.key();
        let existing = self
            .tasks
            .find_task(key)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(key.clone()))?;
        if !existing.is_same_submission(task) {
            return Err(DispatchError::DuplicateTask(key.clone()));
        }
        if existing.status() == Status::Created {
            info!(task = %key, "completing interrupted admission on resubmission");
            return self.admit(existing).await;
        }
        let pending = self
            .queue
            .find_entry(key)
            .await?
            .is_some_and(|entry| entry.state() == DispatchState::Pending);
        if pending {
            self.bus.publish(DispatchEvent::first(key.clone())).await?;
            debug!(task = %key, "republished pending task on resubmission");
        }
        Ok(key.clone())
    }

    /// Attempts to claim the task announced by `event` for `worker`.
    ///
    /// The claim is a single conditional update; transient store failures
    /// are retried with exponential back-off.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoWork`] when another worker won the claim or
    /// the task already finished, and [`DispatchError::Store`] once retries
    /// are exhausted.
    pub async fn claim(
        &self,
        worker: &WorkerId,
        event: &DispatchEvent,
    ) -> DispatchResult<ClaimedTask> {
        let key = &event.key;
        let deadline = lease_deadline(self.clock.utc(), self.settings.lease_window);
        let claimed = self
            .retry_transient("claim", move || self.queue.try_claim(key, worker, deadline))
            .await?;
        let Some(entry) = claimed else {
            debug!(task = %key, worker = %worker, "claim lost to another worker");
            return Err(DispatchError::NoWork(key.clone()));
        };

        let task = match self.retry_transient("load", move || self.tasks.find_task(key)).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task = %key, "queue entry without task document");
                self.queue.remove_entry(key).await?;
                return Err(DispatchError::NoWork(key.clone()));
            }
            Err(err) => {
                self.queue.release(key, worker).await?;
                return Err(err.into());
            }
        };
        if task.status().is_terminal() {
            debug!(task = %key, status = %task.status(), "claimed task already finished");
            self.queue.remove_entry(key).await?;
            return Err(DispatchError::NoWork(key.clone()));
        }

        info!(
            pipeline = %key.pipeline_name(),
            task_id = %key.task_id(),
            worker = %worker,
            delivery = event.delivery,
            "task claimed"
        );
        Ok(ClaimedTask {
            task,
            entry,
            worker: worker.clone(),
            delivery: event.delivery,
        })
    }

    async fn retry_transient<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut backoff = self.settings.initial_backoff;
        let mut retries = 0_u32;
        loop {
            match attempt().await {
                Err(err) if err.is_transient() && retries < self.settings.max_retries => {
                    warn!(operation, retries, error = %err, "store unavailable, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(self.settings.max_backoff);
                    retries = retries.saturating_add(1);
                }
                result => return result,
            }
        }
    }

    /// Marks a claimed task as executing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] when the claim was lost.
    pub async fn mark_running(&self, key: &TaskKey, worker: &WorkerId) -> DispatchResult<QueueEntry> {
        Ok(self.queue.mark_running(key, worker).await?)
    }

    /// Extends the lease held by `worker`.
    ///
    /// The returned entry carries the cancellation flag.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] when the claim was lost.
    pub async fn heartbeat(&self, key: &TaskKey, worker: &WorkerId) -> DispatchResult<QueueEntry> {
        let deadline = lease_deadline(self.clock.utc(), self.settings.lease_window);
        Ok(self.queue.heartbeat(key, worker, deadline).await?)
    }

    /// Returns claims whose lease expired to pending and republishes them.
    ///
    /// Returns the keys that were redelivered.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the store or bus fails.
    pub async fn requeue_expired(&self) -> DispatchResult<Vec<TaskKey>> {
        let now = self.clock.utc();
        let mut redelivered = Vec::new();
        for expired in self.queue.expired_claims(now).await? {
            let Some(entry) = self.queue.release_expired(expired.key(), now).await? else {
                continue;
            };
            let delivery = entry.attempts().saturating_add(1);
            self.bus
                .publish(DispatchEvent::redelivery(entry.key().clone(), delivery))
                .await?;
            warn!(
                task = %entry.key(),
                previous_worker = ?expired.worker().map(WorkerId::as_str),
                delivery,
                "claim lease expired, task redelivered"
            );
            redelivered.push(entry.key().clone());
        }
        Ok(redelivered)
    }

    /// Returns a held task to the queue so another worker resumes it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the claim was lost or the bus fails.
    pub async fn release(&self, key: &TaskKey, worker: &WorkerId) -> DispatchResult<()> {
        let entry = self.queue.release(key, worker).await?;
        self.bus
            .publish(DispatchEvent::redelivery(
                key.clone(),
                entry.attempts().saturating_add(1),
            ))
            .await?;
        info!(task = %key, worker = %worker, "claim released");
        Ok(())
    }

    /// Requests cancellation of a task.
    ///
    /// Unclaimed tasks are cancelled directly, deleting any workload an
    /// earlier holder left running. Claimed tasks get their cancellation
    /// flag raised for the claim holder to act on.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TaskNotFound`] for unknown keys, or store
    /// errors.
    pub async fn cancel(&self, key: &TaskKey) -> DispatchResult<CancelOutcome> {
        let mut task = self
            .tasks
            .find_task(key)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(key.clone()))?;
        if task.status().is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(task.status()));
        }

        let entry = self.queue.request_cancel(key).await?;
        let held = entry
            .as_ref()
            .is_some_and(|queued| queued.state() != DispatchState::Pending);
        if held {
            info!(task = %key, "cancellation requested from claim holder");
            return Ok(CancelOutcome::Requested);
        }

        self.release_workloads(&task).await;
        task.cancel_unfinished(&*self.clock);
        task.transition_to(Status::Cancelled, &*self.clock)?;
        self.tasks.update_task(&task).await?;
        if entry.is_some() {
            self.queue.remove_entry(key).await?;
        }
        info!(task = %key, "queued task cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Deletes the workloads recorded on unfinished subtasks.
    async fn release_workloads(&self, task: &Task) {
        let handles: Vec<_> = task
            .subtasks()
            .iter()
            .filter(|subtask| !subtask.status().is_terminal())
            .filter_map(Subtask::workload)
            .collect();
        if handles.is_empty() {
            return;
        }
        let client = match self.clusters.resolve(task.cluster_id()) {
            Ok((_, client)) => client,
            Err(err) => {
                warn!(task = %task.key(), error = %err, "cannot reach cluster of cancelled task");
                return;
            }
        };
        for handle in handles {
            match client.delete(handle).await {
                Ok(()) => debug!(task = %task.key(), workload = %handle, "orphaned workload deleted"),
                Err(err) => warn!(workload = %handle, error = %err, "workload teardown failed"),
            }
        }
    }

    /// Loads a task document.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TaskNotFound`] for unknown keys.
    pub async fn get_task(&self, key: &TaskKey) -> DispatchResult<Task> {
        self.tasks
            .find_task(key)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(key.clone()))
    }
}
