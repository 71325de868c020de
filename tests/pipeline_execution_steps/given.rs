//! Given steps for pipeline execution BDD scenarios.

use std::time::Duration;

use super::world::{PipelineWorld, run_async};
use eyre::WrapErr;
use pipewright::pipeline::{
    adapters::memory::{ScriptedOutcome, WorkloadScript},
    domain::{
        BuildPayload, DeployPayload, DockerBuildPayload, PipelineType, Subtask, SubtaskKind,
        SubtaskPayload, TaskDraft, TaskKey,
    },
};
use rstest_bdd_macros::given;
use tokio_util::sync::CancellationToken;

const STEP_TIMEOUT: Duration = Duration::from_secs(600);

fn parse_kind(kind: &str) -> Result<SubtaskKind, eyre::Report> {
    SubtaskKind::try_from(kind).map_err(|err| eyre::eyre!("invalid subtask kind in scenario: {err}"))
}

#[given("a pipeline engine with {count:usize} workers")]
fn pipeline_engine(world: &mut PipelineWorld, count: usize) -> Result<(), eyre::Report> {
    let engine = world.build_engine()?;
    let pool = run_async(engine.spawn_workers(count, CancellationToken::new()))
        .wrap_err("spawn scenario workers")?;
    world.engine = Some(engine);
    world.pool = Some(pool);
    Ok(())
}

#[given(r#"the "{kind}" workload exits with code {exit_code:i32}"#)]
fn workload_fails(world: &mut PipelineWorld, kind: String, exit_code: i32) -> Result<(), eyre::Report> {
    let script = WorkloadScript::new(ScriptedOutcome::Fail {
        exit_code,
        reason: "Error".to_owned(),
    });
    world.cluster.push_script(parse_kind(&kind)?, script);
    Ok(())
}

#[given(r#"the "{kind}" workload hangs"#)]
fn workload_hangs(world: &mut PipelineWorld, kind: String) -> Result<(), eyre::Report> {
    world
        .cluster
        .push_script(parse_kind(&kind)?, WorkloadScript::new(ScriptedOutcome::Hang));
    Ok(())
}

#[given(r#"a release task {task_id:u64} for service "{service}""#)]
fn release_task(world: &mut PipelineWorld, task_id: u64, service: String) -> Result<(), eyre::Report> {
    let key = TaskKey::from_parts("checkout", task_id)?;
    let image = format!("registry.local/{service}:latest");
    let draft = TaskDraft::new(key, PipelineType::Workflow)
        .with_subtask(Subtask::new(
            SubtaskPayload::Build(BuildPayload {
                service_name: service.clone(),
                build_os: "focal".to_owned(),
                script: "make".to_owned(),
                ..BuildPayload::default()
            }),
            STEP_TIMEOUT,
        ))
        .with_subtask(Subtask::new(
            SubtaskPayload::DockerBuild(DockerBuildPayload {
                service_name: service.clone(),
                image: image.clone(),
                ..DockerBuildPayload::default()
            }),
            STEP_TIMEOUT,
        ))
        .with_subtask(Subtask::new(
            SubtaskPayload::Deploy(DeployPayload {
                env_name: "staging".to_owned(),
                service_name: service.clone(),
                container_name: service.clone(),
                image,
            }),
            STEP_TIMEOUT,
        ));
    world.service = service;
    world.draft = Some(draft);
    Ok(())
}
