//! Then steps for pipeline execution BDD scenarios.

use std::time::Duration;

use super::world::{PipelineWorld, run_async};
use pipewright::pipeline::domain::{Status, Subtask, SubtaskKind, workload_name};
use rstest_bdd_macros::then;

const PATIENCE: Duration = Duration::from_secs(10);

fn parse_status(status: &str) -> Result<Status, eyre::Report> {
    Status::try_from(status).map_err(|err| eyre::eyre!("invalid status in scenario: {err}"))
}

#[then(r#"the task finishes with status "{status}""#)]
fn task_finishes_with(world: &mut PipelineWorld, status: String) -> Result<(), eyre::Report> {
    let expected = parse_status(&status)?;
    let key = world.task_key()?.clone();
    let engine = world.engine()?;
    let task = run_async(async {
        let deadline = tokio::time::Instant::now() + PATIENCE;
        loop {
            let task = engine.get_task(&key).await?;
            if task.status().is_terminal() {
                return Ok::<_, eyre::Report>(task);
            }
            eyre::ensure!(
                tokio::time::Instant::now() < deadline,
                "task {key} still {}",
                task.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })?;
    if task.status() != expected {
        return Err(eyre::eyre!(
            "expected status {expected}, found {}",
            task.status()
        ));
    }
    world.finished = Some(task);
    Ok(())
}

#[then(r#"the subtask statuses are "{statuses}""#)]
fn subtask_statuses_are(world: &PipelineWorld, statuses: String) -> Result<(), eyre::Report> {
    let expected = statuses
        .split(',')
        .map(parse_status)
        .collect::<Result<Vec<_>, _>>()?;
    let task = world
        .finished
        .as_ref()
        .ok_or_else(|| eyre::eyre!("missing finished task"))?;
    let actual: Vec<_> = task.subtasks().iter().map(Subtask::status).collect();
    if actual != expected {
        return Err(eyre::eyre!("expected {expected:?}, found {actual:?}"));
    }
    Ok(())
}

#[then(r#"the "{kind}" workload was deleted once"#)]
fn workload_deleted_once(world: &PipelineWorld, kind: String) -> Result<(), eyre::Report> {
    let parsed = SubtaskKind::try_from(kind.as_str())
        .map_err(|err| eyre::eyre!("invalid subtask kind in scenario: {err}"))?;
    let name = workload_name(world.task_key()?, parsed, Some(&world.service));
    let deletions = world.cluster.delete_count(&name);
    if deletions != 1 {
        return Err(eyre::eyre!("{name} deleted {deletions} times"));
    }
    Ok(())
}
