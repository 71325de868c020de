//! Engine bootstrap: wires stores, bus, clusters, and review systems into the
//! pipeline services and runs the worker pool.

use super::coordinator::ExecutionCoordinator;
use super::dispatch::{CancelOutcome, DispatchResult, DispatchService, DispatchSettings};
use super::feedback::ScmFeedbackService;
use super::logs::{LogLineStream, LogStreamRequest, LogStreamService};
use super::worker::{LeaseReaper, Worker};
use crate::config::{ConfigError, EngineConfig};
use crate::pipeline::{
    domain::{PipelineName, Task, TaskDraft, TaskKey, WorkerId},
    ports::{
        BusResult, ClusterRegistry, DispatchBus, QueueStore, ReviewClientRegistry,
        ReviewNotificationStore, TaskStore,
    },
};
use mockable::Clock;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Adapters the engine is assembled from.
pub struct EngineParts<C>
where
    C: Clock + Send + Sync,
{
    /// Task persistence.
    pub tasks: Arc<dyn TaskStore>,
    /// Durable queue entries.
    pub queue: Arc<dyn QueueStore>,
    /// Dispatch notifications.
    pub bus: Arc<dyn DispatchBus>,
    /// Cluster clients.
    pub clusters: ClusterRegistry,
    /// Review system clients.
    pub reviews: ReviewClientRegistry,
    /// Review notification records.
    pub notifications: Arc<dyn ReviewNotificationStore>,
    /// Time source.
    pub clock: Arc<C>,
}

/// Assembled pipeline engine.
pub struct Engine<C>
where
    C: Clock + Send + Sync,
{
    config: Arc<EngineConfig>,
    bus: Arc<dyn DispatchBus>,
    dispatch: DispatchService<C>,
    coordinator: ExecutionCoordinator<C>,
    feedback: ScmFeedbackService,
    logs: LogStreamService,
}

impl<C> Engine<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Validates `config` and assembles the engine services.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is unusable.
    pub fn new(parts: EngineParts<C>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = Arc::new(config);
        let EngineParts {
            tasks,
            queue,
            bus,
            clusters,
            reviews,
            notifications,
            clock,
        } = parts;

        let dispatch = DispatchService::new(
            Arc::clone(&tasks),
            Arc::clone(&queue),
            Arc::clone(&bus),
            clusters.clone(),
            Arc::clone(&clock),
            DispatchSettings::from_config(&shared),
        );
        let feedback =
            ScmFeedbackService::new(reviews, notifications, shared.review_base_uri.clone());
        let logs = LogStreamService::new(Arc::clone(&tasks), clusters.clone(), &shared);
        let coordinator = ExecutionCoordinator::new(
            tasks,
            queue,
            clusters,
            feedback.clone(),
            clock,
            Arc::clone(&shared),
        );
        Ok(Self {
            config: shared,
            bus,
            dispatch,
            coordinator,
            feedback,
            logs,
        })
    }

    /// Returns the validated configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the dispatch service.
    #[must_use]
    pub const fn dispatch(&self) -> &DispatchService<C> {
        &self.dispatch
    }

    /// Returns the execution coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &ExecutionCoordinator<C> {
        &self.coordinator
    }

    /// Allocates the next task key for `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error raised by the store.
    pub async fn allocate_task_key(&self, pipeline: &PipelineName) -> DispatchResult<TaskKey> {
        self.dispatch.allocate_task_key(pipeline).await
    }

    /// Validates, persists, and announces a task.
    ///
    /// # Errors
    ///
    /// See [`DispatchService::enqueue`].
    pub async fn enqueue(&self, draft: TaskDraft) -> DispatchResult<TaskKey> {
        self.dispatch.enqueue(draft).await
    }

    /// Loads a task.
    ///
    /// # Errors
    ///
    /// Returns [`super::DispatchError::TaskNotFound`] for unknown keys.
    pub async fn get_task(&self, key: &TaskKey) -> DispatchResult<Task> {
        self.dispatch.get_task(key).await
    }

    /// Cancels a task, reporting the final status to its review when the
    /// cancellation took effect immediately.
    ///
    /// # Errors
    ///
    /// See [`DispatchService::cancel`].
    pub async fn cancel_task(&self, key: &TaskKey) -> DispatchResult<CancelOutcome> {
        let outcome = self.dispatch.cancel(key).await?;
        if outcome == CancelOutcome::Cancelled {
            let task = self.dispatch.get_task(key).await?;
            self.feedback.notify_best_effort(&task).await;
        }
        Ok(outcome)
    }

    /// Streams the output of a subtask workload.
    #[must_use]
    pub fn stream_task_logs(&self, request: LogStreamRequest) -> LogLineStream {
        self.logs.stream_logs(request)
    }

    /// Starts `count` workers and the lease reaper.
    ///
    /// Everything stops once `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the bus error when a worker cannot subscribe.
    pub async fn spawn_workers(
        &self,
        count: usize,
        shutdown: CancellationToken,
    ) -> BusResult<EngineHandle> {
        let mut set = JoinSet::new();
        for _ in 0..count {
            let subscription = self.bus.subscribe().await?;
            let worker = Worker::new(
                WorkerId::generate(),
                self.dispatch.clone(),
                self.coordinator.clone(),
                self.config.heartbeat_interval(),
            );
            set.spawn(worker.run(subscription, shutdown.clone()));
        }
        let reaper = LeaseReaper::new(self.dispatch.clone(), self.config.reaper_interval());
        set.spawn(reaper.run(shutdown.clone()));
        info!(workers = count, "pipeline workers started");
        Ok(EngineHandle { set, shutdown })
    }
}

/// Running worker pool.
#[derive(Debug)]
pub struct EngineHandle {
    set: JoinSet<()>,
    shutdown: CancellationToken,
}

impl EngineHandle {
    /// Asks every worker to stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every worker and the reaper to exit.
    pub async fn wait(mut self) {
        while let Some(joined) = self.set.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "pipeline worker exited abnormally");
            }
        }
    }

    /// Stops the pool and waits for it to drain.
    pub async fn shutdown(self) {
        self.stop();
        self.wait().await;
    }
}
