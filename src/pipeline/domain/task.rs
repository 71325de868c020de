//! Task aggregate root, submission drafts, and pipeline types.

use super::{
    aggregate_status, ClusterId, InvalidTaskReason, ParsePipelineTypeError, ReviewRef, Status,
    Subtask, TaskDomainError, TaskKey, WorkloadHandle,
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of pipeline a task is an execution of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Single-service pipeline.
    Single,
    /// Multi-service workflow.
    Workflow,
    /// Freestyle job sequence.
    Freestyle,
    /// Test-only pipeline.
    Test,
    /// Artifact delivery pipeline.
    Artifact,
}

impl PipelineType {
    /// All pipeline types.
    pub const ALL: [Self; 5] = [
        Self::Single,
        Self::Workflow,
        Self::Freestyle,
        Self::Test,
        Self::Artifact,
    ];

    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Workflow => "workflow",
            Self::Freestyle => "freestyle",
            Self::Test => "test",
            Self::Artifact => "artifact",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for PipelineType {
    type Error = ParsePipelineTypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|pipeline_type| pipeline_type.as_str() == normalized)
            .ok_or_else(|| ParsePipelineTypeError(value.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum DraftSubtask {
    Typed(Subtask),
    Raw(Value),
}

/// Submitted task that has not been validated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    key: TaskKey,
    pipeline_type: PipelineType,
    subtasks: Vec<DraftSubtask>,
    cluster_id: Option<ClusterId>,
    triggered_by: Option<String>,
    review: Option<ReviewRef>,
}

impl TaskDraft {
    /// Creates an empty draft for the given key.
    #[must_use]
    pub const fn new(key: TaskKey, pipeline_type: PipelineType) -> Self {
        Self {
            key,
            pipeline_type,
            subtasks: Vec::new(),
            cluster_id: None,
            triggered_by: None,
            review: None,
        }
    }

    /// Returns the task key the draft will be stored under.
    #[must_use]
    pub const fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Appends a typed subtask.
    #[must_use]
    pub fn with_subtask(mut self, subtask: Subtask) -> Self {
        self.subtasks.push(DraftSubtask::Typed(subtask));
        self
    }

    /// Appends an untyped subtask map carrying a `type` discriminator.
    #[must_use]
    pub fn with_raw_subtask(mut self, subtask: Value) -> Self {
        self.subtasks.push(DraftSubtask::Raw(subtask));
        self
    }

    /// Targets an explicit cluster instead of the default one.
    #[must_use]
    pub fn with_cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Records the triggering actor.
    #[must_use]
    pub fn with_triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = Some(actor.into());
        self
    }

    /// Links the task to an originating code-review request.
    #[must_use]
    pub fn with_review(mut self, review: ReviewRef) -> Self {
        self.review = Some(review);
        self
    }

    /// Parses raw subtasks and validates the resulting task.
    ///
    /// Disabled subtasks are recorded as [`Status::Skipped`] up front.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTask`] when a subtask cannot be
    /// parsed or the task fails [`Task::validate`].
    pub fn into_task(self, clock: &impl Clock) -> Result<Task, TaskDomainError> {
        let subtasks = self
            .subtasks
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let subtask = match draft {
                    DraftSubtask::Typed(subtask) => subtask,
                    DraftSubtask::Raw(value) => Subtask::from_value(index, value)?,
                };
                Ok(normalize_new_subtask(subtask))
            })
            .collect::<Result<Vec<_>, TaskDomainError>>()?;

        let timestamp = clock.utc();
        let task = Task {
            key: self.key,
            pipeline_type: self.pipeline_type,
            status: Status::Created,
            subtasks,
            cluster_id: self.cluster_id,
            triggered_by: self.triggered_by,
            review: self.review,
            created_at: timestamp,
            updated_at: timestamp,
            start_time: None,
            end_time: None,
            version: 0,
        };
        task.validate()?;
        Ok(task)
    }
}

fn normalize_new_subtask(mut subtask: Subtask) -> Subtask {
    if subtask.is_enabled() {
        subtask.set_status(Status::Created);
    } else {
        subtask.set_status(Status::Skipped);
    }
    subtask
}

/// Task aggregate root: one execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    key: TaskKey,
    pipeline_type: PipelineType,
    status: Status,
    subtasks: Vec<Subtask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster_id: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    triggered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    review: Option<ReviewRef>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    version: u64,
}

impl Task {
    /// Returns the task key.
    #[must_use]
    pub const fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Returns the pipeline type.
    #[must_use]
    pub const fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    /// Returns the task status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the subtasks in execution order.
    #[must_use]
    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    /// Returns the subtask at `index`.
    #[must_use]
    pub fn subtask(&self, index: usize) -> Option<&Subtask> {
        self.subtasks.get(index)
    }

    /// Returns the explicit target cluster, if any.
    #[must_use]
    pub const fn cluster_id(&self) -> Option<&ClusterId> {
        self.cluster_id.as_ref()
    }

    /// Returns the triggering actor, if recorded.
    #[must_use]
    pub fn triggered_by(&self) -> Option<&str> {
        self.triggered_by.as_deref()
    }

    /// Returns the originating review request, if any.
    #[must_use]
    pub const fn review(&self) -> Option<&ReviewRef> {
        self.review.as_ref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the latest mutation timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns when execution started.
    #[must_use]
    pub const fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Returns when the task reached a terminal status.
    #[must_use]
    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Returns the optimistic-concurrency version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Returns a copy stamped with the given stored version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Checks structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTask`] when the task has no
    /// subtasks or an enabled subtask has a zero timeout.
    pub fn validate(&self) -> Result<(), TaskDomainError> {
        if self.subtasks.is_empty() {
            return Err(TaskDomainError::InvalidTask(InvalidTaskReason::NoSubtasks));
        }
        let zero_timeout = self
            .subtasks
            .iter()
            .enumerate()
            .find(|(_, subtask)| subtask.is_enabled() && subtask.timeout().is_zero());
        if let Some((index, subtask)) = zero_timeout {
            return Err(TaskDomainError::InvalidTask(
                InvalidTaskReason::NonPositiveTimeout {
                    index,
                    kind: subtask.kind(),
                },
            ));
        }
        Ok(())
    }

    /// Returns whether `other` is the same submission, ignoring execution
    /// state and timestamps.
    #[must_use]
    pub fn is_same_submission(&self, other: &Self) -> bool {
        self.key == other.key
            && self.pipeline_type == other.pipeline_type
            && self.cluster_id == other.cluster_id
            && self.triggered_by == other.triggered_by
            && self.review == other.review
            && self.subtasks.len() == other.subtasks.len()
            && self
                .subtasks
                .iter()
                .zip(&other.subtasks)
                .all(|(mine, theirs)| mine.has_same_definition(theirs))
    }

    /// Returns the subtasks in the order they execute.
    ///
    /// Declaration order is the only dependency mechanism.
    pub fn flatten_subtasks(&self) -> impl Iterator<Item = (usize, &Subtask)> {
        self.subtasks.iter().enumerate()
    }

    /// Returns the status aggregated from the subtasks.
    #[must_use]
    pub fn aggregate_status(&self) -> Status {
        aggregate_status(self.subtasks.iter().map(Subtask::status))
    }

    /// Returns whether every subtask has reached a terminal status.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.subtasks.iter().all(|subtask| subtask.status().is_terminal())
    }

    /// Transitions the task to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::IllegalTransition`] when the state machine
    /// forbids the move.
    pub fn transition_to(&mut self, target: Status, clock: &impl Clock) -> Result<(), TaskDomainError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskDomainError::IllegalTransition {
                key: self.key.clone(),
                from: self.status,
                to: target,
            });
        }
        let now = clock.utc();
        if target == Status::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if target.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Transitions the subtask at `index` to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::SubtaskIndexOutOfRange`] for unknown
    /// positions, [`TaskDomainError::SubtaskDisabled`] when a disabled subtask
    /// would run, and [`TaskDomainError::IllegalSubtaskTransition`] when the
    /// state machine forbids the move.
    pub fn transition_subtask(
        &mut self,
        index: usize,
        target: Status,
        clock: &impl Clock,
    ) -> Result<(), TaskDomainError> {
        let key = self.key.clone();
        let subtask = self
            .subtasks
            .get_mut(index)
            .ok_or_else(|| TaskDomainError::SubtaskIndexOutOfRange {
                key: key.clone(),
                index,
            })?;
        if !subtask.is_enabled() && target == Status::Running {
            return Err(TaskDomainError::SubtaskDisabled { key, index });
        }
        let from = subtask.status();
        if !from.can_transition_to(target) {
            return Err(TaskDomainError::IllegalSubtaskTransition {
                key,
                index,
                kind: subtask.kind(),
                from,
                to: target,
            });
        }
        let now = clock.utc();
        if target == Status::Running {
            subtask.set_start_time(now);
            subtask.reset_error();
        }
        if target.is_terminal() {
            subtask.set_end_time(now);
        }
        subtask.set_status(target);
        self.updated_at = now;
        Ok(())
    }

    /// Moves the task to its aggregated status once every subtask settled.
    ///
    /// Returns the resulting task status.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::IllegalTransition`] when the aggregated
    /// status is not reachable from the current one.
    pub fn refresh_status(&mut self, clock: &impl Clock) -> Result<Status, TaskDomainError> {
        if self.status.is_terminal() || !self.is_settled() {
            return Ok(self.status);
        }
        let aggregated = self.aggregate_status();
        if aggregated != self.status {
            self.transition_to(aggregated, clock)?;
        }
        Ok(self.status)
    }

    /// Marks every unfinished subtask from `from_index` on as skipped.
    ///
    /// Cleanup subtasks are left untouched when `keep_cleanup` is set.
    /// Returns the positions that were skipped.
    pub fn skip_remaining(
        &mut self,
        from_index: usize,
        keep_cleanup: bool,
        clock: &impl Clock,
    ) -> Vec<usize> {
        let now = clock.utc();
        let mut skipped = Vec::new();
        for (index, subtask) in self.subtasks.iter_mut().enumerate().skip(from_index) {
            let pending = subtask.status().can_transition_to(Status::Skipped);
            if pending && !(keep_cleanup && subtask.is_cleanup()) {
                subtask.set_status(Status::Skipped);
                subtask.set_end_time(now);
                skipped.push(index);
            }
        }
        if !skipped.is_empty() {
            self.updated_at = now;
        }
        skipped
    }

    /// Marks every unfinished subtask as cancelled.
    ///
    /// Returns the positions that were cancelled.
    pub fn cancel_unfinished(&mut self, clock: &impl Clock) -> Vec<usize> {
        let now = clock.utc();
        let mut cancelled = Vec::new();
        for (index, subtask) in self.subtasks.iter_mut().enumerate() {
            if !subtask.status().is_terminal() {
                subtask.set_status(Status::Cancelled);
                subtask.set_end_time(now);
                cancelled.push(index);
            }
        }
        if !cancelled.is_empty() {
            self.updated_at = now;
        }
        cancelled
    }

    /// Records an error message on the subtask at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::SubtaskIndexOutOfRange`] for unknown
    /// positions.
    pub fn record_subtask_error(
        &mut self,
        index: usize,
        error: impl Into<String>,
    ) -> Result<(), TaskDomainError> {
        self.subtask_mut(index)?.set_error(error);
        Ok(())
    }

    /// Records (or clears) the workload handle of the subtask at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::SubtaskIndexOutOfRange`] for unknown
    /// positions.
    pub fn record_workload(
        &mut self,
        index: usize,
        workload: Option<WorkloadHandle>,
    ) -> Result<(), TaskDomainError> {
        self.subtask_mut(index)?.set_workload(workload);
        Ok(())
    }

    /// Flags the subtask at `index` as re-executed after redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::SubtaskIndexOutOfRange`] for unknown
    /// positions.
    pub fn mark_subtask_restart(&mut self, index: usize) -> Result<(), TaskDomainError> {
        self.subtask_mut(index)?.mark_restart();
        Ok(())
    }

    /// Records the log file reference of the subtask at `index`.
    ///
    /// This is the only mutation permitted once the task is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::SubtaskIndexOutOfRange`] for unknown
    /// positions.
    pub fn record_log_file(
        &mut self,
        index: usize,
        log_file: impl Into<String>,
    ) -> Result<(), TaskDomainError> {
        self.subtask_mut(index)?.set_log_file(log_file.into());
        Ok(())
    }

    fn subtask_mut(&mut self, index: usize) -> Result<&mut Subtask, TaskDomainError> {
        let key = &self.key;
        self.subtasks
            .get_mut(index)
            .ok_or_else(|| TaskDomainError::SubtaskIndexOutOfRange {
                key: key.clone(),
                index,
            })
    }
}
