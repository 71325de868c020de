//! Shared world state for pipeline execution BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use mockable::DefaultClock;
use pipewright::config::EngineConfig;
use pipewright::pipeline::{
    adapters::memory::{
        InMemoryCluster, InMemoryDispatchBus, InMemoryPipelineStore,
        InMemoryReviewNotificationStore,
    },
    domain::{Task, TaskDraft, TaskKey},
    ports::{ClusterRegistry, ReviewClientRegistry},
    services::{Engine, EngineHandle, EngineParts},
};
use rstest::fixture;

/// Scenario world for pipeline execution behaviour tests.
pub struct PipelineWorld {
    pub cluster: InMemoryCluster,
    pub engine: Option<Engine<DefaultClock>>,
    pub pool: Option<EngineHandle>,
    pub service: String,
    pub draft: Option<TaskDraft>,
    pub task_key: Option<TaskKey>,
    pub finished: Option<Task>,
}

impl PipelineWorld {
    /// Creates a world with a script-free cluster and no engine yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cluster: InMemoryCluster::new(),
            engine: None,
            pool: None,
            service: String::new(),
            draft: None,
            task_key: None,
            finished: None,
        }
    }

    /// Assembles an engine over in-memory adapters sharing the world cluster.
    ///
    /// # Errors
    ///
    /// Returns an error when the test configuration is rejected.
    pub fn build_engine(&self) -> Result<Engine<DefaultClock>, eyre::Report> {
        let config = EngineConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat(Duration::from_millis(50), 3)
            .with_reaper_interval(Duration::from_millis(20));
        let store = InMemoryPipelineStore::new();
        let clusters = ClusterRegistry::new(config.default_cluster_id())
            .with_client(config.default_cluster_id(), Arc::new(self.cluster.clone()));
        let parts = EngineParts {
            tasks: Arc::new(store.clone()),
            queue: Arc::new(store),
            bus: Arc::new(InMemoryDispatchBus::new()),
            clusters,
            reviews: ReviewClientRegistry::new(),
            notifications: Arc::new(InMemoryReviewNotificationStore::new()),
            clock: Arc::new(DefaultClock),
        };
        Ok(Engine::new(parts, config)?)
    }

    /// Returns the engine built by the background step.
    ///
    /// # Errors
    ///
    /// Returns an error when no engine has been built.
    pub fn engine(&self) -> Result<&Engine<DefaultClock>, eyre::Report> {
        self.engine
            .as_ref()
            .ok_or_else(|| eyre::eyre!("missing engine in scenario world"))
    }

    /// Returns the key of the enqueued task.
    ///
    /// # Errors
    ///
    /// Returns an error when nothing has been enqueued.
    pub fn task_key(&self) -> Result<&TaskKey, eyre::Report> {
        self.task_key
            .as_ref()
            .ok_or_else(|| eyre::eyre!("missing task key in scenario world"))
    }
}

impl Drop for PipelineWorld {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.stop();
        }
    }
}

impl Default for PipelineWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixture that creates a new scenario world.
#[fixture]
pub fn world() -> PipelineWorld {
    PipelineWorld::default()
}

/// Runs an async operation within sync step definitions.
pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
