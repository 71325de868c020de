//! Live log streaming from the workload of a subtask.

use crate::config::EngineConfig;
use crate::pipeline::{
    domain::{SubtaskKind, TaskKey, WorkloadHandle, WorkloadLabels, WorkloadPhase},
    ports::{ClusterClient, ClusterError, ClusterRegistry, LogOptions, LogReader, StoreError, TaskStore},
};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

const LINE_BUFFER: usize = 256;

/// Errors surfaced on a log stream.
#[derive(Debug, Error)]
pub enum LogStreamError {
    /// The task does not exist.
    #[error("task {0} not found")]
    TaskNotFound(TaskKey),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cluster operation failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Reading workload output failed.
    #[error("failed to read workload output: {0}")]
    Io(#[from] std::io::Error),
}

/// Lazy sequence of output lines; dropping it stops the underlying read.
pub type LogLineStream = BoxStream<'static, Result<String, LogStreamError>>;

/// Selects the workload whose output should be streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamRequest {
    /// Task the subtask belongs to.
    pub key: TaskKey,
    /// Subtask kind.
    pub kind: SubtaskKind,
    /// Service name, for service-scoped subtasks.
    pub service: Option<String>,
    /// Keep streaming while the workload runs.
    pub follow: bool,
    /// Start from the last N lines.
    pub tail_lines: Option<u64>,
}

impl LogStreamRequest {
    /// Creates a following request for the whole output.
    #[must_use]
    pub const fn new(key: TaskKey, kind: SubtaskKind) -> Self {
        Self {
            key,
            kind,
            service: None,
            follow: true,
            tail_lines: None,
        }
    }

    /// Selects a service-scoped workload.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets whether the stream follows new output.
    #[must_use]
    pub const fn with_follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    /// Starts from the last `lines` lines.
    #[must_use]
    pub const fn with_tail_lines(mut self, lines: u64) -> Self {
        self.tail_lines = Some(lines);
        self
    }
}

/// Streams workload output to interactive callers.
#[derive(Clone)]
pub struct LogStreamService {
    tasks: Arc<dyn TaskStore>,
    clusters: ClusterRegistry,
    namespace: String,
    wait_ceiling: Duration,
    poll_interval: Duration,
}

impl LogStreamService {
    /// Creates a log stream service.
    #[must_use]
    pub fn new(tasks: Arc<dyn TaskStore>, clusters: ClusterRegistry, config: &EngineConfig) -> Self {
        Self {
            tasks,
            clusters,
            namespace: config.namespace.clone(),
            wait_ceiling: config.log_wait_ceiling(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Streams the output of the workload selected by `request`.
    ///
    /// Waits up to the configured ceiling for a matching workload to start.
    /// When none does, the stream ends without yielding anything. Only the
    /// first matching workload is streamed. Errors are yielded once and end
    /// the stream.
    #[must_use]
    pub fn stream_logs(&self, request: LogStreamRequest) -> LogLineStream {
        let (sender, receiver) = mpsc::channel(LINE_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = sender.closed() => debug!(task = %request.key, "log stream consumer went away"),
                () = service.forward(&request, &sender) => {}
            }
        });
        ReceiverStream::new(receiver).boxed()
    }

    async fn forward(
        &self,
        request: &LogStreamRequest,
        sender: &mpsc::Sender<Result<String, LogStreamError>>,
    ) {
        let reader = match self.open(request).await {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                debug!(
                    task = %request.key,
                    subtask = %request.kind,
                    "no running workload before the wait ceiling"
                );
                return;
            }
            Err(err) => {
                sender.send(Err(err)).await.ok();
                return;
            }
        };

        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if sender.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    sender.send(Err(err.into())).await.ok();
                    return;
                }
            }
        }
    }

    async fn open(&self, request: &LogStreamRequest) -> Result<Option<LogReader>, LogStreamError> {
        let task = self
            .tasks
            .find_task(&request.key)
            .await?
            .ok_or_else(|| LogStreamError::TaskNotFound(request.key.clone()))?;
        let (_, client) = self.clusters.resolve(task.cluster_id())?;
        let labels =
            WorkloadLabels::new(&request.key, request.kind, request.service.as_deref(), None)
                .to_map();
        let Some(handle) = self.wait_for_start(&*client, &labels).await? else {
            return Ok(None);
        };
        let options = LogOptions {
            follow: request.follow,
            tail_lines: request.tail_lines,
        };
        debug!(task = %request.key, workload = %handle, "streaming workload output");
        Ok(Some(client.logs(&handle, options).await?))
    }

    /// Polls the label query until a matching workload has started, or the
    /// wait ceiling passes.
    async fn wait_for_start(
        &self,
        client: &dyn ClusterClient,
        labels: &BTreeMap<String, String>,
    ) -> Result<Option<WorkloadHandle>, LogStreamError> {
        let ceiling = tokio::time::sleep(self.wait_ceiling);
        tokio::pin!(ceiling);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = &mut ceiling => return Ok(None),
                _ = ticker.tick() => {}
            }
            let first = client
                .find_workloads(&self.namespace, labels)
                .await?
                .into_iter()
                .next();
            if let Some(workload) = first.filter(|found| has_output(&found.phase)) {
                return Ok(Some(workload.handle));
            }
        }
    }
}

const fn has_output(phase: &WorkloadPhase) -> bool {
    matches!(
        phase,
        WorkloadPhase::Running | WorkloadPhase::Succeeded | WorkloadPhase::Failed { .. }
    )
}
