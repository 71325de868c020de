//! End-to-end runs through the worker pool.

use super::helpers::{
    api_workload, build_step, deploy_step, engine, engine_with, fast_config, image_step, key,
    release_draft, statuses, wait_for_submissions, wait_until_finished,
};
use pipewright::config::FailurePolicy;
use pipewright::pipeline::{
    adapters::memory::{InMemoryCluster, ScriptedOutcome, WorkloadScript},
    domain::{PipelineType, Status, SubtaskKind, Task, TaskDraft},
    services::CancelOutcome,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn failing(exit_code: i32) -> WorkloadScript {
    WorkloadScript::new(ScriptedOutcome::Fail {
        exit_code,
        reason: "Error".to_owned(),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_pool_runs_release_to_completion() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());
    let pool = harness
        .engine
        .spawn_workers(2, CancellationToken::new())
        .await?;

    let task_key = harness.engine.enqueue(release_draft(1)).await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    assert_eq!(task.status(), Status::Passed);
    assert_eq!(statuses(&task), vec![Status::Passed; 3]);
    for kind in [SubtaskKind::Build, SubtaskKind::DockerBuild, SubtaskKind::Deploy] {
        assert_eq!(
            harness.cluster.delete_count(&api_workload(&task_key, kind)),
            1,
            "{kind} workload should be deleted exactly once"
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_image_build_skips_deploy() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new().with_script(SubtaskKind::DockerBuild, failing(2));
    let harness = engine(cluster);
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;

    let task_key = harness.engine.enqueue(release_draft(2)).await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    assert_eq!(task.status(), Status::Failed);
    assert_eq!(
        statuses(&task),
        vec![Status::Passed, Status::Failed, Status::Skipped]
    );
    assert_eq!(harness.cluster.submitted().len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_subtask_still_runs_after_failure() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new().with_script(SubtaskKind::Build, failing(1));
    let config = fast_config().with_failure_policy(PipelineType::Workflow, FailurePolicy::RunCleanup);
    let harness = engine_with(cluster, config);
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let draft = TaskDraft::new(key(3), PipelineType::Workflow)
        .with_subtask(build_step("api"))
        .with_subtask(image_step("api"))
        .with_subtask(deploy_step("api", "stable").as_cleanup());

    let task_key = harness.engine.enqueue(draft).await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    assert_eq!(task.status(), Status::Failed);
    assert_eq!(
        statuses(&task),
        vec![Status::Failed, Status::Skipped, Status::Passed]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_a_running_deploy_stops_the_workload() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new()
        .with_script(SubtaskKind::Deploy, WorkloadScript::new(ScriptedOutcome::Hang));
    let harness = engine(cluster);
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;

    let task_key = harness.engine.enqueue(release_draft(4)).await?;
    wait_for_submissions(&harness.cluster, 3).await?;
    let outcome = harness.engine.cancel_task(&task_key).await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    assert_eq!(outcome, CancelOutcome::Requested);
    assert_eq!(task.status(), Status::Cancelled);
    assert_eq!(
        statuses(&task),
        vec![Status::Passed, Status::Passed, Status::Cancelled]
    );
    assert_eq!(
        harness
            .cluster
            .delete_count(&api_workload(&task_key, SubtaskKind::Deploy)),
        1
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_task_is_reported_as_finished_afterwards() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());

    let task_key = harness.engine.enqueue(release_draft(5)).await?;
    let first = harness.engine.cancel_task(&task_key).await?;
    let second = harness.engine.cancel_task(&task_key).await?;
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown().await;

    assert_eq!(first, CancelOutcome::Cancelled);
    assert_eq!(second, CancelOutcome::AlreadyFinished(Status::Cancelled));
    assert!(harness.cluster.submitted().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_task_survives_a_json_round_trip() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;

    let task_key = harness.engine.enqueue(release_draft(6)).await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    let encoded = serde_json::to_string(&task)?;
    let decoded: Task = serde_json::from_str(&encoded)?;
    assert_eq!(decoded, task);
    assert!(
        decoded
            .subtasks()
            .iter()
            .all(|subtask| subtask.log_file().is_some())
    );
    Ok(())
}
