//! Domain model for pipeline execution.
//!
//! Tasks own an ordered list of typed subtasks. Both move through the shared
//! status table in [`Status`], and the task status is aggregated from its
//! subtasks. Everything here is pure data and transition rules; persistence,
//! clusters, and review systems stay outside the domain boundary.

mod error;
mod ids;
mod queue;
mod review;
mod status;
mod subtask;
mod task;
mod workload;

pub use error::{
    InvalidTaskReason, ParsePipelineTypeError, ParseStatusError, ParseSubtaskKindError,
    TaskDomainError,
};
pub use ids::{ClusterId, PipelineName, TaskId, TaskKey, WorkerId};
pub use queue::{DispatchEvent, DispatchState, PersistedQueueEntry, QueueEntry, lease_deadline};
pub use review::{ReviewNotification, ReviewRef};
pub use status::{Status, aggregate_status};
pub use subtask::{
    ArtifactDeployPayload, ArtifactPackagePayload, ArtifactPayload, BuildPayload,
    DeployPayload, DistributePayload, DockerBuildPayload, EnvVar, ExtensionPayload,
    JenkinsBuildPayload, JiraIssue, JiraPayload, ReleaseImagePayload, RepositoryRef,
    ResetImagePayload, SecurityPayload, Subtask, SubtaskKind, SubtaskPayload, TestingPayload,
    TriggerPayload,
};
pub use task::{PipelineType, Task, TaskDraft};
pub use workload::{
    LABEL_PIPELINE_TYPE, LABEL_SERVICE, LABEL_SUBTASK_TYPE, LABEL_TASK, WorkloadContext,
    WorkloadHandle, WorkloadLabels, WorkloadPhase, WorkloadSpec, log_file_name, workload_name,
};
