//! Execution coordinator: drives the subtasks of a claimed task to completion.
//!
//! Subtasks run strictly in declaration order, one workload at a time. Every
//! status change is persisted before it is reported, and the workload of a
//! subtask is deleted exactly once on every exit path except a lost claim,
//! where the new claim holder owns it.

use super::dispatch::ClaimedTask;
use super::feedback::ScmFeedbackService;
use crate::config::{EngineConfig, FailurePolicy};
use crate::pipeline::{
    domain::{
        Status, Subtask, SubtaskKind, Task, TaskDomainError, TaskKey, WorkerId, WorkloadContext,
        WorkloadHandle, WorkloadPhase, WorkloadSpec, log_file_name,
    },
    ports::{ClusterClient, ClusterError, ClusterRegistry, QueueStore, StoreError, TaskStore},
};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors reported by the execution coordinator.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The cluster refused the workload; the task failed.
    #[error("workload for {kind} subtask {index} of {key} could not be submitted: {reason}")]
    WorkloadSubmitFailed {
        /// Task key.
        key: TaskKey,
        /// Subtask position.
        index: usize,
        /// Subtask kind.
        kind: SubtaskKind,
        /// Cluster diagnostic.
        reason: String,
    },

    /// A subtask exceeded its timeout; the task timed out.
    #[error("{kind} subtask {index} of {key} exceeded its {timeout_secs}s timeout")]
    Timeout {
        /// Task key.
        key: TaskKey,
        /// Subtask position.
        index: usize,
        /// Subtask kind.
        kind: SubtaskKind,
        /// Configured timeout in seconds.
        timeout_secs: u64,
    },

    /// The task was cancelled.
    #[error("task {0} was cancelled")]
    Cancelled(TaskKey),

    /// Shutdown stopped execution before the task finished.
    #[error("execution of {0} was interrupted before completion")]
    Interrupted(TaskKey),

    /// Another worker took over the claim.
    #[error("claim on {0} was lost to another worker")]
    ClaimLost(TaskKey),

    /// A state transition was rejected.
    #[error(transparent)]
    Domain(#[from] TaskDomainError),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cluster operation failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// The workload specification could not be encoded.
    #[error("failed to encode workload spec: {0}")]
    Spec(#[from] serde_json::Error),
}

impl ExecutionError {
    /// Returns whether the task reached a terminal status before the error
    /// was reported.
    #[must_use]
    pub const fn reached_terminal_status(&self) -> bool {
        matches!(
            self,
            Self::WorkloadSubmitFailed { .. } | Self::Timeout { .. } | Self::Cancelled(_)
        )
    }
}

/// Result type for execution operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    CancelRequested,
    Interrupted,
    ClaimLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubtaskOutcome {
    Passed,
    Failed,
    TimedOut,
    Rejected {
        index: usize,
        kind: SubtaskKind,
        reason: String,
    },
    Cancelled,
    Interrupted,
    ClaimLost,
}

/// Drives claimed tasks through their subtasks.
pub struct ExecutionCoordinator<C>
where
    C: Clock + Send + Sync,
{
    tasks: Arc<dyn TaskStore>,
    queue: Arc<dyn QueueStore>,
    clusters: ClusterRegistry,
    feedback: ScmFeedbackService,
    clock: Arc<C>,
    config: Arc<EngineConfig>,
}

impl<C> Clone for ExecutionCoordinator<C>
where
    C: Clock + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            queue: Arc::clone(&self.queue),
            clusters: self.clusters.clone(),
            feedback: self.feedback.clone(),
            clock: Arc::clone(&self.clock),
            config: Arc::clone(&self.config),
        }
    }
}

impl<C> ExecutionCoordinator<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<dyn QueueStore>,
        clusters: ClusterRegistry,
        feedback: ScmFeedbackService,
        clock: Arc<C>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            tasks,
            queue,
            clusters,
            feedback,
            clock,
            config,
        }
    }

    /// Executes a claimed task until it reaches a terminal status.
    ///
    /// Subtasks that already finished are not executed again, so a task
    /// redelivered after a worker crash resumes where it stopped. A subtask
    /// found running is re-queued, flagged as a restart, and resubmitted.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::WorkloadSubmitFailed`],
    /// [`ExecutionError::Timeout`], or [`ExecutionError::Cancelled`] after the
    /// resulting terminal status has been persisted.
    /// [`ExecutionError::Interrupted`] and [`ExecutionError::ClaimLost`]
    /// leave the task running for the next claim holder. Infrastructure
    /// failures are returned as they occur.
    pub async fn run(
        &self,
        claimed: ClaimedTask,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<Task> {
        let ClaimedTask {
            mut task,
            entry,
            worker,
            ..
        } = claimed;
        let key = task.key().clone();
        if entry.cancel_requested() {
            return self.finish_cancelled(task).await;
        }

        self.queue
            .mark_running(&key, &worker)
            .await
            .map_err(|err| claim_error(err, &key))?;
        if task.status() != Status::Running {
            task.transition_to(Status::Running, &*self.clock)?;
            self.persist(&mut task).await?;
            self.feedback.notify_best_effort(&task).await;
            info!(
                pipeline = %key.pipeline_name(),
                task_id = %key.task_id(),
                worker = %worker,
                "task started"
            );
        }

        let failure = match self.drive_subtasks(&mut task, &worker, shutdown).await? {
            SubtaskOutcome::Cancelled => return self.finish_cancelled(task).await,
            SubtaskOutcome::Interrupted => return Err(ExecutionError::Interrupted(key)),
            SubtaskOutcome::ClaimLost => return Err(ExecutionError::ClaimLost(key)),
            SubtaskOutcome::Rejected {
                index,
                kind,
                reason,
            } => Some(ExecutionError::WorkloadSubmitFailed {
                key: key.clone(),
                index,
                kind,
                reason,
            }),
            SubtaskOutcome::TimedOut => first_timeout(&task),
            SubtaskOutcome::Passed | SubtaskOutcome::Failed => None,
        };

        task.refresh_status(&*self.clock)?;
        self.persist(&mut task).await?;
        self.queue.remove_entry(&key).await?;
        self.feedback.notify_best_effort(&task).await;
        info!(
            pipeline = %key.pipeline_name(),
            task_id = %key.task_id(),
            status = %task.status(),
            "task finished"
        );
        failure.map_or(Ok(task), Err)
    }

    /// Runs every unfinished subtask and returns the outcome that decides
    /// how the task ends.
    async fn drive_subtasks(
        &self,
        task: &mut Task,
        worker: &WorkerId,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<SubtaskOutcome> {
        let policy = self.config.failure_policy(task.pipeline_type());
        let mut verdict = SubtaskOutcome::Passed;
        for index in 0..task.subtasks().len() {
            let status = task.subtask(index).map_or(Status::Skipped, Subtask::status);
            if status.is_terminal() {
                continue;
            }
            if status == Status::Running {
                task.transition_subtask(index, Status::Queued, &*self.clock)?;
                task.mark_subtask_restart(index)?;
                self.persist(task).await?;
                info!(task = %task.key(), subtask = index, "restarting subtask after redelivery");
            }

            match self.execute_subtask(task, index, worker, shutdown).await? {
                SubtaskOutcome::Passed => {}
                outcome @ (SubtaskOutcome::Failed | SubtaskOutcome::TimedOut) => {
                    self.skip_after_failure(task, index, policy).await?;
                    if verdict == SubtaskOutcome::Passed {
                        verdict = outcome;
                    }
                }
                rejected @ SubtaskOutcome::Rejected { .. } => {
                    if !task.skip_remaining(index.saturating_add(1), false, &*self.clock).is_empty() {
                        self.persist(task).await?;
                    }
                    return Ok(rejected);
                }
                stop @ (SubtaskOutcome::Cancelled
                | SubtaskOutcome::Interrupted
                | SubtaskOutcome::ClaimLost) => return Ok(stop),
            }
        }
        Ok(verdict)
    }

    async fn execute_subtask(
        &self,
        task: &mut Task,
        index: usize,
        worker: &WorkerId,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<SubtaskOutcome> {
        let key = task.key().clone();
        let subtask = task
            .subtask(index)
            .cloned()
            .ok_or_else(|| TaskDomainError::SubtaskIndexOutOfRange {
                key: key.clone(),
                index,
            })?;
        task.transition_subtask(index, Status::Running, &*self.clock)?;
        self.persist(task).await?;

        let (cluster, client) = match self.clusters.resolve(task.cluster_id()) {
            Ok(resolved) => resolved,
            Err(err) => return self.reject(task, index, err.to_string()).await,
        };
        let context = WorkloadContext {
            namespace: self.config.namespace.clone(),
            cluster,
            reaper_image: self.config.reaper_image.clone(),
        };
        let spec = WorkloadSpec::for_subtask(task, &subtask, &context)?;
        remove_stale_workloads(&*client, &spec).await?;
        let handle = match client.submit(&spec).await {
            Ok(handle) => handle,
            Err(err) => return self.reject(task, index, err.to_string()).await,
        };
        let waited = match self
            .watch_workload(task, index, &*client, &handle, worker, shutdown)
            .await
        {
            Ok(waited) => waited,
            Err(err) => {
                teardown(&*client, &handle).await;
                return Err(err);
            }
        };
        if waited == WaitOutcome::ClaimLost {
            warn!(task = %key, worker = %worker, "claim lost while waiting for workload");
            return Ok(SubtaskOutcome::ClaimLost);
        }
        teardown(&*client, &handle).await;
        task.record_log_file(
            index,
            log_file_name(&key, subtask.kind(), subtask.service_name()),
        )?;

        match waited {
            WaitOutcome::Succeeded => {
                self.settle(task, index, Status::Passed, None).await?;
                Ok(SubtaskOutcome::Passed)
            }
            WaitOutcome::Failed(reason) => {
                self.settle(task, index, Status::Failed, Some(reason)).await?;
                Ok(SubtaskOutcome::Failed)
            }
            WaitOutcome::TimedOut => {
                let reason = format!("timed out after {}s", subtask.timeout().as_secs());
                self.settle(task, index, Status::Timeout, Some(reason)).await?;
                Ok(SubtaskOutcome::TimedOut)
            }
            WaitOutcome::CancelRequested => Ok(SubtaskOutcome::Cancelled),
            WaitOutcome::Interrupted => {
                self.persist(task).await?;
                Ok(SubtaskOutcome::Interrupted)
            }
            WaitOutcome::ClaimLost => Ok(SubtaskOutcome::ClaimLost),
        }
    }

    /// Records the submitted workload on the task and waits for it.
    async fn watch_workload(
        &self,
        task: &mut Task,
        index: usize,
        client: &dyn ClusterClient,
        handle: &WorkloadHandle,
        worker: &WorkerId,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<WaitOutcome> {
        let timeout = task.subtask(index).map_or(Duration::ZERO, Subtask::timeout);
        task.record_workload(index, Some(handle.clone()))?;
        self.persist(task).await?;
        debug!(task = %task.key(), subtask = index, workload = %handle.name, "workload submitted");
        let key = task.key().clone();
        self.await_workload(client, handle, timeout, &key, worker, shutdown)
            .await
    }

    /// Polls the workload until it finishes, the timeout fires, the task is
    /// cancelled, the claim is lost, or shutdown is requested.
    async fn await_workload(
        &self,
        client: &dyn ClusterClient,
        handle: &WorkloadHandle,
        timeout: Duration,
        key: &TaskKey,
        worker: &WorkerId,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<WaitOutcome> {
        let expiry = tokio::time::sleep(timeout);
        tokio::pin!(expiry);
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(WaitOutcome::Interrupted),
                () = &mut expiry => return Ok(WaitOutcome::TimedOut),
                _ = ticker.tick() => {}
            }

            match self.queue.find_entry(key).await? {
                Some(entry) if !entry.is_held_by(worker) => return Ok(WaitOutcome::ClaimLost),
                Some(entry) if entry.cancel_requested() => {
                    return Ok(WaitOutcome::CancelRequested);
                }
                _ => {}
            }

            match client.phase(handle).await? {
                None => {
                    return Ok(WaitOutcome::Failed(
                        "workload disappeared before reporting completion".to_owned(),
                    ));
                }
                Some(WorkloadPhase::Succeeded) => return Ok(WaitOutcome::Succeeded),
                Some(WorkloadPhase::Failed {
                    exit_code: Some(code),
                    reason,
                }) => {
                    return Ok(WaitOutcome::Failed(format!(
                        "workload exited with code {code}: {reason}"
                    )));
                }
                Some(WorkloadPhase::Failed {
                    exit_code: None,
                    reason,
                }) => return Ok(WaitOutcome::Failed(format!("workload failed: {reason}"))),
                Some(WorkloadPhase::Evicted { reason }) => {
                    return Ok(WaitOutcome::Failed(format!(
                        "workload evicted without exit code: {reason}"
                    )));
                }
                Some(WorkloadPhase::Pending | WorkloadPhase::Running) => {}
            }
        }
    }

    async fn settle(
        &self,
        task: &mut Task,
        index: usize,
        status: Status,
        error: Option<String>,
    ) -> ExecutionResult<()> {
        if let Some(message) = error {
            task.record_subtask_error(index, message)?;
        }
        task.transition_subtask(index, status, &*self.clock)?;
        self.persist(task).await?;
        self.feedback.notify_best_effort(task).await;
        debug!(task = %task.key(), subtask = index, %status, "subtask settled");
        Ok(())
    }

    async fn reject(
        &self,
        task: &mut Task,
        index: usize,
        reason: String,
    ) -> ExecutionResult<SubtaskOutcome> {
        warn!(task = %task.key(), subtask = index, %reason, "workload submission failed");
        self.settle(task, index, Status::Failed, Some(reason.clone()))
            .await?;
        let kind = task.subtask(index).map_or(SubtaskKind::Build, Subtask::kind);
        Ok(SubtaskOutcome::Rejected {
            index,
            kind,
            reason,
        })
    }

    async fn skip_after_failure(
        &self,
        task: &mut Task,
        index: usize,
        policy: FailurePolicy,
    ) -> ExecutionResult<()> {
        let keep_cleanup = policy == FailurePolicy::RunCleanup;
        let skipped = task.skip_remaining(index.saturating_add(1), keep_cleanup, &*self.clock);
        if !skipped.is_empty() {
            self.persist(task).await?;
            debug!(task = %task.key(), ?skipped, "remaining subtasks skipped");
        }
        Ok(())
    }

    async fn finish_cancelled(&self, mut task: Task) -> ExecutionResult<Task> {
        let key = task.key().clone();
        task.cancel_unfinished(&*self.clock);
        if !task.status().is_terminal() {
            task.transition_to(Status::Cancelled, &*self.clock)?;
        }
        self.persist(&mut task).await?;
        self.queue.remove_entry(&key).await?;
        self.feedback.notify_best_effort(&task).await;
        info!(pipeline = %key.pipeline_name(), task_id = %key.task_id(), "task cancelled");
        Err(ExecutionError::Cancelled(key))
    }

    async fn persist(&self, task: &mut Task) -> ExecutionResult<()> {
        *task = self.tasks.update_task(task).await?;
        Ok(())
    }
}

fn first_timeout(task: &Task) -> Option<ExecutionError> {
    task.flatten_subtasks()
        .find(|(_, subtask)| subtask.status() == Status::Timeout)
        .map(|(index, subtask)| ExecutionError::Timeout {
            key: task.key().clone(),
            index,
            kind: subtask.kind(),
            timeout_secs: subtask.timeout().as_secs(),
        })
}

/// Deletes workloads left behind by an earlier attempt of the same subtask.
async fn remove_stale_workloads(
    client: &dyn ClusterClient,
    spec: &WorkloadSpec,
) -> ExecutionResult<()> {
    for stale in client.find_workloads(&spec.namespace, &spec.labels).await? {
        client.delete(&stale.handle).await?;
        debug!(workload = %stale.handle, "stale workload deleted");
    }
    Ok(())
}

async fn teardown(client: &dyn ClusterClient, handle: &WorkloadHandle) {
    if let Err(err) = client.delete(handle).await {
        warn!(workload = %handle, error = %err, "workload teardown failed");
    }
}

fn claim_error(err: StoreError, key: &TaskKey) -> ExecutionError {
    match err {
        StoreError::ClaimLost { .. } => ExecutionError::ClaimLost(key.clone()),
        other => other.into(),
    }
}
