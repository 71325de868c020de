//! Shared test helpers for in-memory engine integration tests.

use mockable::DefaultClock;
use pipewright::config::EngineConfig;
use pipewright::pipeline::{
    adapters::memory::{
        InMemoryCluster, InMemoryDispatchBus, InMemoryPipelineStore,
        InMemoryReviewNotificationStore,
    },
    domain::{
        BuildPayload, DeployPayload, DockerBuildPayload, PipelineType, Status, Subtask,
        SubtaskKind, SubtaskPayload, Task, TaskDraft, TaskKey, workload_name,
    },
    ports::{ClusterRegistry, ReviewClientRegistry},
    services::{Engine, EngineParts},
};
use std::sync::Arc;
use std::time::Duration;

/// Poll interval used by every test engine.
pub const POLL: Duration = Duration::from_millis(10);

/// Upper bound on how long a test waits for the engine.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Engine together with handles on its in-memory adapters.
pub struct TestEngine {
    pub engine: Engine<DefaultClock>,
    pub store: InMemoryPipelineStore,
    pub bus: InMemoryDispatchBus,
    pub cluster: InMemoryCluster,
}

/// Returns a configuration with short intervals.
#[must_use]
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(POLL)
        .with_heartbeat(Duration::from_millis(50), 3)
        .with_reaper_interval(Duration::from_millis(20))
        .with_claim_retry(Duration::from_millis(5), Duration::from_millis(20), 3)
        .with_log_wait_ceiling(Duration::from_secs(2))
}

/// Builds an engine over fresh in-memory adapters.
///
/// # Panics
///
/// Panics when `config` is invalid.
#[must_use]
pub fn engine_with(cluster: InMemoryCluster, config: EngineConfig) -> TestEngine {
    let store = InMemoryPipelineStore::new();
    let bus = InMemoryDispatchBus::new();
    let clusters = ClusterRegistry::new(config.default_cluster_id())
        .with_client(config.default_cluster_id(), Arc::new(cluster.clone()));
    let parts = EngineParts {
        tasks: Arc::new(store.clone()),
        queue: Arc::new(store.clone()),
        bus: Arc::new(bus.clone()),
        clusters,
        reviews: ReviewClientRegistry::new(),
        notifications: Arc::new(InMemoryReviewNotificationStore::new()),
        clock: Arc::new(DefaultClock),
    };
    let engine = Engine::new(parts, config).expect("test configuration is valid");
    TestEngine {
        engine,
        store,
        bus,
        cluster,
    }
}

/// Builds an engine with [`fast_config`].
#[must_use]
pub fn engine(cluster: InMemoryCluster) -> TestEngine {
    engine_with(cluster, fast_config())
}

/// Returns the key of task `task_id` in the `checkout` pipeline.
///
/// # Panics
///
/// Panics when the key is invalid.
#[must_use]
pub fn key(task_id: u64) -> TaskKey {
    TaskKey::from_parts("checkout", task_id).expect("valid task key")
}

/// Returns the workload name of the `api` subtask of `kind`.
#[must_use]
pub fn api_workload(task_key: &TaskKey, kind: SubtaskKind) -> String {
    workload_name(task_key, kind, Some("api"))
}

const STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// Build step for `service`.
#[must_use]
pub fn build_step(service: &str) -> Subtask {
    Subtask::new(
        SubtaskPayload::Build(BuildPayload {
            service_name: service.to_owned(),
            build_os: "focal".to_owned(),
            script: "make".to_owned(),
            ..BuildPayload::default()
        }),
        STEP_TIMEOUT,
    )
}

/// Image build step for `service`.
#[must_use]
pub fn image_step(service: &str) -> Subtask {
    Subtask::new(
        SubtaskPayload::DockerBuild(DockerBuildPayload {
            service_name: service.to_owned(),
            image: format!("registry.local/{service}:latest"),
            ..DockerBuildPayload::default()
        }),
        STEP_TIMEOUT,
    )
}

/// Staging deploy step for `service` rolling out `tag`.
#[must_use]
pub fn deploy_step(service: &str, tag: &str) -> Subtask {
    Subtask::new(
        SubtaskPayload::Deploy(DeployPayload {
            env_name: "staging".to_owned(),
            service_name: service.to_owned(),
            container_name: service.to_owned(),
            image: format!("registry.local/{service}:{tag}"),
        }),
        STEP_TIMEOUT,
    )
}

/// Draft with the build, image, and deploy steps of the `api` service.
#[must_use]
pub fn release_draft(task_id: u64) -> TaskDraft {
    TaskDraft::new(key(task_id), PipelineType::Workflow)
        .with_subtask(build_step("api"))
        .with_subtask(image_step("api"))
        .with_subtask(deploy_step("api", "latest"))
}

/// Returns the subtask statuses of `task` in order.
#[must_use]
pub fn statuses(task: &Task) -> Vec<Status> {
    task.subtasks().iter().map(Subtask::status).collect()
}

/// Polls the engine until `accept` holds for the task, or the patience
/// runs out.
///
/// # Errors
///
/// Returns an error when the task cannot be loaded or never satisfies
/// `accept`.
pub async fn wait_for_task(
    engine: &Engine<DefaultClock>,
    task_key: &TaskKey,
    accept: impl Fn(&Task) -> bool,
) -> Result<Task, eyre::Report> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        let task = engine.get_task(task_key).await?;
        if accept(&task) {
            return Ok(task);
        }
        eyre::ensure!(
            tokio::time::Instant::now() < deadline,
            "task {task_key} stuck in {} with subtasks {:?}",
            task.status(),
            statuses(&task)
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Waits until the task reaches a terminal status.
///
/// # Errors
///
/// Returns an error when the task never finishes.
pub async fn wait_until_finished(
    engine: &Engine<DefaultClock>,
    task_key: &TaskKey,
) -> Result<Task, eyre::Report> {
    wait_for_task(engine, task_key, |task| task.status().is_terminal()).await
}

/// Waits until `count` workloads have been submitted.
///
/// # Errors
///
/// Returns an error when the submissions never arrive.
pub async fn wait_for_submissions(
    cluster: &InMemoryCluster,
    count: usize,
) -> Result<(), eyre::Report> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while cluster.submitted().len() < count {
        eyre::ensure!(
            tokio::time::Instant::now() < deadline,
            "expected {count} submissions, saw {}",
            cluster.submitted().len()
        );
        tokio::time::sleep(POLL).await;
    }
    Ok(())
}
