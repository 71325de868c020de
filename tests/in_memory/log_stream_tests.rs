//! Live workload output streaming.

use super::helpers::{engine, engine_with, fast_config, key, release_draft, wait_for_submissions};
use futures::StreamExt;
use pipewright::pipeline::{
    adapters::memory::{InMemoryCluster, ScriptedOutcome, WorkloadScript},
    domain::SubtaskKind,
    services::{LogStreamError, LogStreamRequest},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread")]
async fn running_build_output_is_streamed_line_by_line() -> Result<(), eyre::Report> {
    let script = WorkloadScript::new(ScriptedOutcome::Hang).with_logs([
        "fetching sources",
        "compiling api",
        "build finished",
    ]);
    let harness = engine(InMemoryCluster::new().with_script(SubtaskKind::Build, script));
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let task_key = harness.engine.enqueue(release_draft(1)).await?;
    wait_for_submissions(&harness.cluster, 1).await?;

    let request = LogStreamRequest::new(task_key, SubtaskKind::Build).with_service("api");
    let lines: Vec<String> = harness
        .engine
        .stream_task_logs(request)
        .map(|line| line.map_err(eyre::Report::from))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
    pool.shutdown().await;

    assert_eq!(lines, vec!["fetching sources", "compiling api", "build finished"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_request_returns_the_last_lines() -> Result<(), eyre::Report> {
    let script = WorkloadScript::new(ScriptedOutcome::Hang).with_logs(["one", "two", "three"]);
    let harness = engine(InMemoryCluster::new().with_script(SubtaskKind::Build, script));
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let task_key = harness.engine.enqueue(release_draft(2)).await?;
    wait_for_submissions(&harness.cluster, 1).await?;

    let request = LogStreamRequest::new(task_key, SubtaskKind::Build)
        .with_service("api")
        .with_follow(false)
        .with_tail_lines(2);
    let lines: Vec<_> = harness.engine.stream_task_logs(request).collect().await;
    pool.shutdown().await;

    let text: Vec<String> = lines.into_iter().filter_map(Result::ok).collect();
    assert_eq!(text, vec!["two", "three"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_ends_empty_when_no_workload_starts() -> Result<(), eyre::Report> {
    let config = fast_config().with_log_wait_ceiling(Duration::from_millis(100));
    let harness = engine_with(InMemoryCluster::new(), config);
    let task_key = harness.engine.enqueue(release_draft(3)).await?;

    let request = LogStreamRequest::new(task_key, SubtaskKind::Deploy).with_service("api");
    let lines: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        harness.engine.stream_task_logs(request).collect::<Vec<_>>(),
    )
    .await?;

    assert!(lines.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_task_yields_a_single_error() {
    let harness = engine(InMemoryCluster::new());

    let request = LogStreamRequest::new(key(404), SubtaskKind::Build);
    let items: Vec<_> = harness.engine.stream_task_logs(request).collect().await;

    assert_eq!(items.len(), 1);
    assert!(matches!(
        items.first(),
        Some(Err(LogStreamError::TaskNotFound(missing))) if *missing == key(404)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_workload_yields_no_lines_before_the_ceiling() -> Result<(), eyre::Report> {
    let script = WorkloadScript::new(ScriptedOutcome::NeverStart).with_logs(["never shown"]);
    let cluster = InMemoryCluster::new().with_script(SubtaskKind::Build, script);
    let config = fast_config().with_log_wait_ceiling(Duration::from_millis(100));
    let harness = engine_with(cluster, config);
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let task_key = harness.engine.enqueue(release_draft(5)).await?;
    wait_for_submissions(&harness.cluster, 1).await?;
    let queries_before = harness.cluster.label_query_count();

    let request = LogStreamRequest::new(task_key, SubtaskKind::Build).with_service("api");
    let lines: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        harness.engine.stream_task_logs(request).collect::<Vec<_>>(),
    )
    .await?;
    pool.shutdown().await;

    assert!(lines.is_empty(), "pending workload produced {lines:?}");
    assert!(harness.cluster.label_query_count() > queries_before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_stream_stops_waiting_for_the_workload() -> Result<(), eyre::Report> {
    let cluster = InMemoryCluster::new()
        .with_script(SubtaskKind::Build, WorkloadScript::new(ScriptedOutcome::NeverStart));
    let config = fast_config().with_log_wait_ceiling(Duration::from_secs(30));
    let harness = engine_with(cluster, config);
    let pool = harness
        .engine
        .spawn_workers(1, CancellationToken::new())
        .await?;
    let task_key = harness.engine.enqueue(release_draft(6)).await?;
    wait_for_submissions(&harness.cluster, 1).await?;
    let queries_before = harness.cluster.label_query_count();

    let request = LogStreamRequest::new(task_key, SubtaskKind::Build).with_service("api");
    let mut stream = harness.engine.stream_task_logs(request);
    let waiting = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queries_after_drop = harness.cluster.label_query_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let queries_later = harness.cluster.label_query_count();
    pool.shutdown().await;

    assert!(waiting.is_err(), "nothing should arrive from a pending workload");
    assert!(queries_after_drop > queries_before);
    assert_eq!(queries_later, queries_after_drop);
    Ok(())
}
