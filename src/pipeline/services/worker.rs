//! Long-lived worker and lease reaper loops.

use super::coordinator::{ExecutionCoordinator, ExecutionError, ExecutionResult};
use super::dispatch::{ClaimedTask, DispatchError, DispatchService};
use crate::pipeline::{
    domain::{DispatchEvent, Task, WorkerId},
    ports::DispatchSubscription,
};
use mockable::Clock;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Result of handling one dispatch event.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The event did not lead to a claim.
    NotClaimed,
    /// The task ran to a terminal status.
    Completed(Box<Task>),
    /// Execution ended with an error.
    Aborted(ExecutionError),
}

/// Claims dispatched tasks and executes them one at a time.
pub struct Worker<C>
where
    C: Clock + Send + Sync,
{
    id: WorkerId,
    dispatch: DispatchService<C>,
    coordinator: ExecutionCoordinator<C>,
    heartbeat_interval: Duration,
}

impl<C> Worker<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a worker.
    #[must_use]
    pub const fn new(
        id: WorkerId,
        dispatch: DispatchService<C>,
        coordinator: ExecutionCoordinator<C>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            id,
            dispatch,
            coordinator,
            heartbeat_interval,
        }
    }

    /// Returns the worker identifier.
    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Consumes dispatch events until the bus closes or `shutdown` fires.
    pub async fn run(
        self,
        mut subscription: Box<dyn DispatchSubscription>,
        shutdown: CancellationToken,
    ) {
        info!(worker = %self.id, "worker started");
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = subscription.next() => next,
            };
            match next {
                Ok(Some(event)) => {
                    let outcome = self.process(event, &shutdown).await;
                    debug!(worker = %self.id, ?outcome, "dispatch event handled");
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = %self.id, error = %err, "dispatch bus unavailable");
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(BUS_RETRY_DELAY) => {}
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Claims the task announced by `event` and executes it.
    ///
    /// An interrupted or failed run hands the claim back so another worker
    /// can resume the task.
    pub async fn process(&self, event: DispatchEvent, shutdown: &CancellationToken) -> ProcessOutcome {
        let claimed = match self.dispatch.claim(&self.id, &event).await {
            Ok(claimed) => claimed,
            Err(DispatchError::NoWork(_)) => return ProcessOutcome::NotClaimed,
            Err(err) => {
                warn!(worker = %self.id, task = %event.key, error = %err, "claim failed");
                return ProcessOutcome::NotClaimed;
            }
        };

        match self.execute_with_heartbeats(claimed, shutdown).await {
            Ok(task) => ProcessOutcome::Completed(Box::new(task)),
            Err(err) => {
                if !err.reached_terminal_status() && !matches!(err, ExecutionError::ClaimLost(_)) {
                    self.hand_back(&event, &err).await;
                }
                ProcessOutcome::Aborted(err)
            }
        }
    }

    async fn hand_back(&self, event: &DispatchEvent, cause: &ExecutionError) {
        warn!(worker = %self.id, task = %event.key, error = %cause, "execution stopped, releasing claim");
        if let Err(err) = self.dispatch.release(&event.key, &self.id).await {
            warn!(worker = %self.id, task = %event.key, error = %err, "claim release failed");
        }
    }

    async fn execute_with_heartbeats(
        &self,
        claimed: ClaimedTask,
        shutdown: &CancellationToken,
    ) -> ExecutionResult<Task> {
        let key = claimed.task.key().clone();
        let run = self.coordinator.run(claimed, shutdown);
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                result = &mut run => return result,
                _ = ticker.tick() => {
                    if let Err(err) = self.dispatch.heartbeat(&key, &self.id).await {
                        warn!(worker = %self.id, task = %key, error = %err, "heartbeat failed");
                    }
                }
            }
        }
    }
}

/// Periodically returns expired claims to the queue.
pub struct LeaseReaper<C>
where
    C: Clock + Send + Sync,
{
    dispatch: DispatchService<C>,
    interval: Duration,
}

impl<C> LeaseReaper<C>
where
    C: Clock + Send + Sync,
{
    /// Creates a reaper sweeping every `interval`.
    #[must_use]
    pub const fn new(dispatch: DispatchService<C>, interval: Duration) -> Self {
        Self { dispatch, interval }
    }

    /// Sweeps until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
        debug!("lease reaper stopped");
    }

    /// Runs one sweep.
    pub async fn sweep(&self) {
        match self.dispatch.requeue_expired().await {
            Ok(redelivered) if !redelivered.is_empty() => {
                info!(count = redelivered.len(), "expired claims redelivered");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "lease sweep failed"),
        }
    }
}
