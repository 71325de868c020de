//! Dispatch guarantees observed through the assembled engine.

use super::helpers::{
    PATIENCE, api_workload, engine, engine_with, fast_config, release_draft, statuses,
    wait_for_task, wait_until_finished,
};
use pipewright::pipeline::{
    adapters::memory::{InMemoryCluster, ScriptedOutcome, WorkloadScript},
    domain::{DispatchEvent, DispatchState, PipelineName, Status, SubtaskKind, WorkerId},
    ports::{QueueStore, TaskStore},
    services::{CancelOutcome, DispatchError},
};
use mockable::DefaultClock;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn resubmitting_the_same_task_keeps_one_queue_entry() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());

    let first = harness.engine.enqueue(release_draft(1)).await?;
    let second = harness.engine.enqueue(release_draft(1)).await?;
    let entry = harness.store.find_entry(&first).await?;

    assert_eq!(first, second);
    assert_eq!(
        entry.map(|queued| queued.state()),
        Some(DispatchState::Pending)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn task_keys_are_allocated_per_pipeline() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());
    let checkout = PipelineName::new("checkout")?;
    let billing = PipelineName::new("billing")?;

    let first = harness.engine.allocate_task_key(&checkout).await?;
    let second = harness.engine.allocate_task_key(&checkout).await?;
    let other = harness.engine.allocate_task_key(&billing).await?;

    assert_eq!(first.task_id().value().saturating_add(1), second.task_id().value());
    assert_eq!(other.pipeline_name(), &billing);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claims_have_a_single_winner() -> Result<(), eyre::Report> {
    let harness = engine(InMemoryCluster::new());
    let task_key = harness.engine.enqueue(release_draft(2)).await?;

    let mut claims = JoinSet::new();
    for worker in 0..8 {
        let dispatch = harness.engine.dispatch().clone();
        let event = DispatchEvent::first(task_key.clone());
        claims.spawn(async move {
            dispatch
                .claim(&WorkerId::new(format!("worker-{worker}")), &event)
                .await
        });
    }
    let mut winners = 0_usize;
    let mut losers = 0_usize;
    while let Some(joined) = claims.join_next().await {
        match joined? {
            Ok(_) => winners = winners.saturating_add(1),
            Err(DispatchError::NoWork(_)) => losers = losers.saturating_add(1),
            Err(err) => return Err(err.into()),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(losers, 7);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_claim_is_resumed_by_a_live_worker() -> Result<(), eyre::Report> {
    let config = fast_config().with_heartbeat(Duration::from_millis(20), 3);
    let harness = engine_with(InMemoryCluster::new(), config);
    let task_key = harness.engine.enqueue(release_draft(3)).await?;

    let ghost = WorkerId::new("ghost");
    let claimed = harness
        .engine
        .dispatch()
        .claim(&ghost, &DispatchEvent::first(task_key.clone()))
        .await?;
    let mut crashed = claimed.task;
    crashed.transition_to(Status::Running, &DefaultClock)?;
    crashed.transition_subtask(0, Status::Running, &DefaultClock)?;
    crashed.transition_subtask(0, Status::Passed, &DefaultClock)?;
    harness.store.update_task(&crashed).await?;

    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let task = wait_until_finished(&harness.engine, &task_key).await?;
    pool.shutdown().await;

    let submitted: Vec<_> = harness
        .cluster
        .submitted()
        .into_iter()
        .map(|spec| spec.name)
        .collect();
    assert_eq!(task.status(), Status::Passed);
    assert_eq!(statuses(&task), vec![Status::Passed; 3]);
    assert_eq!(submitted.len(), 2, "build must not run again: {submitted:?}");
    assert!(harness.bus.published_count() >= 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_task_is_handed_back_on_shutdown() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new()
        .with_script(SubtaskKind::DockerBuild, WorkloadScript::new(ScriptedOutcome::Hang));
    let harness = engine(cluster);
    let shutdown = CancellationToken::new();
    let pool = harness.engine.spawn_workers(1, shutdown.clone()).await?;

    let task_key = harness.engine.enqueue(release_draft(4)).await?;
    wait_for_task(&harness.engine, &task_key, |task| {
        task.subtask(1)
            .is_some_and(|subtask| subtask.status() == Status::Running)
    })
    .await?;
    shutdown.cancel();
    tokio::time::timeout(PATIENCE, pool.wait()).await?;

    let task = harness.engine.get_task(&task_key).await?;
    let entry = harness.store.find_entry(&task_key).await?;
    assert_eq!(task.status(), Status::Running);
    assert_eq!(
        entry.map(|queued| queued.state()),
        Some(DispatchState::Pending)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_after_a_worker_crash_deletes_the_orphaned_workload() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new()
        .with_script(SubtaskKind::Build, WorkloadScript::new(ScriptedOutcome::Hang));
    let config = fast_config().with_heartbeat(Duration::from_millis(20), 3);
    let harness = engine_with(cluster, config);
    let task_key = harness.engine.enqueue(release_draft(5)).await?;
    let claimed = harness
        .engine
        .dispatch()
        .claim(&WorkerId::new("doomed"), &DispatchEvent::first(task_key.clone()))
        .await?;

    let coordinator = harness.engine.coordinator().clone();
    let doomed = tokio::spawn(async move {
        coordinator.run(claimed, &CancellationToken::new()).await
    });
    wait_for_task(&harness.engine, &task_key, |task| {
        task.subtask(0)
            .is_some_and(|subtask| subtask.workload().is_some())
    })
    .await?;
    doomed.abort();
    assert!(doomed.await.is_err_and(|err| err.is_cancelled()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let redelivered = harness.engine.dispatch().requeue_expired().await?;
    let outcome = harness.engine.cancel_task(&task_key).await?;
    let task = harness.engine.get_task(&task_key).await?;

    assert_eq!(redelivered, vec![task_key.clone()]);
    assert_eq!(outcome, CancelOutcome::Cancelled);
    assert_eq!(task.status(), Status::Cancelled);
    assert_eq!(
        harness
            .cluster
            .delete_count(&api_workload(&task_key, SubtaskKind::Build)),
        1
    );
    Ok(())
}
