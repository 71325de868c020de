//! When steps for pipeline execution BDD scenarios.

use std::time::Duration;

use super::world::{PipelineWorld, run_async};
use eyre::WrapErr;
use rstest_bdd_macros::when;

const PATIENCE: Duration = Duration::from_secs(10);

#[when("the task is enqueued")]
fn task_enqueued(world: &mut PipelineWorld) -> Result<(), eyre::Report> {
    let draft = world
        .draft
        .clone()
        .ok_or_else(|| eyre::eyre!("missing draft in scenario world"))?;
    let key = run_async(world.engine()?.enqueue(draft)).wrap_err("enqueue scenario task")?;
    world.task_key = Some(key);
    Ok(())
}

#[when("the same task is enqueued again")]
fn task_enqueued_again(world: &mut PipelineWorld) -> Result<(), eyre::Report> {
    let draft = world
        .draft
        .clone()
        .ok_or_else(|| eyre::eyre!("missing draft in scenario world"))?;
    let key = run_async(world.engine()?.enqueue(draft)).wrap_err("resubmit scenario task")?;
    if Some(&key) != world.task_key.as_ref() {
        return Err(eyre::eyre!("resubmission returned a different key: {key}"));
    }
    Ok(())
}

#[when("the task is cancelled once {count:usize} workloads were submitted")]
fn task_cancelled_after_submissions(
    world: &mut PipelineWorld,
    count: usize,
) -> Result<(), eyre::Report> {
    let cluster = world.cluster.clone();
    run_async(async move {
        let deadline = tokio::time::Instant::now() + PATIENCE;
        while cluster.submitted().len() < count {
            eyre::ensure!(
                tokio::time::Instant::now() < deadline,
                "only {} workloads were submitted",
                cluster.submitted().len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    })?;
    let key = world.task_key()?.clone();
    run_async(world.engine()?.cancel_task(&key)).wrap_err("cancel scenario task")?;
    Ok(())
}
