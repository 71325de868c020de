//! Scriptable in-memory cluster for tests and local runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::pipeline::{
    domain::{LABEL_SUBTASK_TYPE, SubtaskKind, WorkloadHandle, WorkloadPhase, WorkloadSpec},
    ports::{
        ClusterClient, ClusterError, ClusterResult, LogOptions, LogReader, WorkloadSummary,
    },
};

/// How a scripted workload ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Exits with code zero.
    Succeed,
    /// Exits with a non-zero code.
    Fail {
        /// Exit code to report.
        exit_code: i32,
        /// Diagnostic reason.
        reason: String,
    },
    /// Disappears without an exit code.
    Evict,
    /// Keeps running until deleted.
    Hang,
    /// Never gets scheduled.
    NeverStart,
    /// Is refused at submission.
    Reject,
}

/// Behaviour of the next workload submitted for a subtask kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadScript {
    outcome: ScriptedOutcome,
    running_polls: usize,
    log_lines: Vec<String>,
}

impl WorkloadScript {
    /// Creates a script that reaches `outcome` on the first status poll.
    #[must_use]
    pub const fn new(outcome: ScriptedOutcome) -> Self {
        Self {
            outcome,
            running_polls: 0,
            log_lines: Vec::new(),
        }
    }

    /// Delays the outcome until the `polls`-th status poll.
    #[must_use]
    pub const fn running_for(mut self, polls: usize) -> Self {
        self.running_polls = polls;
        self
    }

    /// Sets the output the workload produces.
    #[must_use]
    pub fn with_logs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    fn phases(&self) -> VecDeque<WorkloadPhase> {
        let mut phases: VecDeque<WorkloadPhase> =
            std::iter::repeat_n(WorkloadPhase::Running, self.running_polls.max(1)).collect();
        match &self.outcome {
            ScriptedOutcome::Succeed => phases.push_back(WorkloadPhase::Succeeded),
            ScriptedOutcome::Fail { exit_code, reason } => {
                phases.push_back(WorkloadPhase::Failed {
                    exit_code: Some(*exit_code),
                    reason: reason.clone(),
                });
            }
            ScriptedOutcome::Evict => phases.push_back(WorkloadPhase::Evicted {
                reason: "workload evicted".to_owned(),
            }),
            ScriptedOutcome::Hang | ScriptedOutcome::Reject => {}
            ScriptedOutcome::NeverStart => {
                phases.clear();
                phases.push_back(WorkloadPhase::Pending);
            }
        }
        phases
    }
}

#[derive(Debug)]
struct WorkloadRecord {
    spec: WorkloadSpec,
    current: WorkloadPhase,
    upcoming: VecDeque<WorkloadPhase>,
    log_output: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    scripts: HashMap<String, VecDeque<WorkloadScript>>,
    workloads: BTreeMap<String, WorkloadRecord>,
    submitted: Vec<WorkloadSpec>,
    deleted: Vec<WorkloadHandle>,
    label_queries: usize,
}

/// In-memory cluster whose workloads follow per-kind scripts.
///
/// Unscripted workloads succeed on the first status poll. Scripts queued for
/// the same kind are consumed in submission order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    /// Creates a cluster with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the script used by the next workload of `kind`.
    #[must_use]
    pub fn with_script(self, kind: SubtaskKind, script: WorkloadScript) -> Self {
        self.push_script(kind, script);
        self
    }

    /// Queues the script used by the next workload of `kind`.
    pub fn push_script(&self, kind: SubtaskKind, script: WorkloadScript) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripts
                .entry(kind.label_value())
                .or_default()
                .push_back(script);
        }
    }

    /// Returns every accepted workload specification, in submission order.
    #[must_use]
    pub fn submitted(&self) -> Vec<WorkloadSpec> {
        self.state
            .lock()
            .map(|state| state.submitted.clone())
            .unwrap_or_default()
    }

    /// Returns every delete call, in call order.
    #[must_use]
    pub fn deleted(&self) -> Vec<WorkloadHandle> {
        self.state
            .lock()
            .map(|state| state.deleted.clone())
            .unwrap_or_default()
    }

    /// Returns how many delete calls targeted the workload `name`.
    #[must_use]
    pub fn delete_count(&self, name: &str) -> usize {
        self.deleted()
            .iter()
            .filter(|handle| handle.name == name)
            .count()
    }

    /// Returns how many label queries the cluster has answered.
    #[must_use]
    pub fn label_query_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.label_queries)
            .unwrap_or_default()
    }

    fn lock(&self) -> ClusterResult<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|err| ClusterError::transport(std::io::Error::other(err.to_string())))
    }
}

fn render_log_output(lines: &[String], tail_lines: Option<u64>) -> String {
    let skip = tail_lines
        .and_then(|tail| usize::try_from(tail).ok())
        .map_or(0, |tail| lines.len().saturating_sub(tail));
    lines
        .iter()
        .skip(skip)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn submit(&self, spec: &WorkloadSpec) -> ClusterResult<WorkloadHandle> {
        let mut state = self.lock()?;
        let kind = spec
            .labels
            .get(LABEL_SUBTASK_TYPE)
            .cloned()
            .unwrap_or_default();
        let script = state
            .scripts
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| WorkloadScript::new(ScriptedOutcome::Succeed));
        if script.outcome == ScriptedOutcome::Reject {
            return Err(ClusterError::Rejected(format!(
                "admission denied for {}",
                spec.name
            )));
        }

        let mut upcoming = script.phases();
        let current = upcoming.pop_front().unwrap_or(WorkloadPhase::Pending);
        let record = WorkloadRecord {
            spec: spec.clone(),
            current,
            upcoming,
            log_output: script.log_lines.join("\n"),
        };
        state.workloads.insert(spec.name.clone(), record);
        state.submitted.push(spec.clone());
        Ok(spec.handle())
    }

    async fn phase(&self, handle: &WorkloadHandle) -> ClusterResult<Option<WorkloadPhase>> {
        let mut state = self.lock()?;
        let phase = state.workloads.get_mut(&handle.name).map(|record| {
            if let Some(next) = record.upcoming.pop_front() {
                record.current = next;
            }
            record.current.clone()
        });
        Ok(phase)
    }

    async fn find_workloads(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<WorkloadSummary>> {
        let mut state = self.lock()?;
        state.label_queries = state.label_queries.saturating_add(1);
        let found = state
            .workloads
            .values()
            .filter(|record| record.spec.namespace == namespace)
            .filter(|record| {
                labels
                    .iter()
                    .all(|(name, value)| record.spec.labels.get(name) == Some(value))
            })
            .map(|record| WorkloadSummary {
                handle: record.spec.handle(),
                phase: record.current.clone(),
            })
            .collect();
        Ok(found)
    }

    async fn logs(&self, handle: &WorkloadHandle, options: LogOptions) -> ClusterResult<LogReader> {
        let state = self.lock()?;
        let record = state.workloads.get(&handle.name).ok_or_else(|| {
            ClusterError::transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("workload {handle} not found"),
            ))
        })?;
        let lines: Vec<String> = record.log_output.lines().map(str::to_owned).collect();
        let output = if record.log_output.is_empty() {
            String::new()
        } else {
            render_log_output(&lines, options.tail_lines)
        };
        Ok(Box::pin(Cursor::new(output.into_bytes())))
    }

    async fn delete(&self, handle: &WorkloadHandle) -> ClusterResult<()> {
        let mut state = self.lock()?;
        state.workloads.remove(&handle.name);
        state.deleted.push(handle.clone());
        Ok(())
    }
}
