//! Mapping from subtasks to containerised workload specifications.

use super::{ClusterId, EnvVar, RepositoryRef, Subtask, SubtaskKind, SubtaskPayload, Task, TaskKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Label carrying `<lowercased pipeline>-<task id>`.
pub const LABEL_TASK: &str = "s-task";
/// Label carrying the lowercased service name.
pub const LABEL_SERVICE: &str = "s-service";
/// Label carrying the subtask kind with `_` replaced by `-`.
pub const LABEL_SUBTASK_TYPE: &str = "s-type";
/// Label carrying the pipeline type.
pub const LABEL_PIPELINE_TYPE: &str = "p-type";

const MAX_WORKLOAD_NAME_LENGTH: usize = 63;
const NAME_HASH_BYTES: usize = 5;

/// Label set identifying the workload of one subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadLabels {
    task: String,
    service: String,
    subtask_type: String,
    pipeline_type: String,
}

impl WorkloadLabels {
    /// Builds the label set for `kind`/`service` within task `key`.
    #[must_use]
    pub fn new(
        key: &TaskKey,
        kind: SubtaskKind,
        service: Option<&str>,
        pipeline_type: Option<&str>,
    ) -> Self {
        Self {
            task: format!(
                "{}-{}",
                key.pipeline_name().as_str().to_lowercase(),
                key.task_id()
            ),
            service: service.unwrap_or_default().to_lowercase(),
            subtask_type: kind.label_value(),
            pipeline_type: pipeline_type.unwrap_or_default().to_owned(),
        }
    }

    /// Returns the labels as a map, omitting empty values.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        [
            (LABEL_TASK, &self.task),
            (LABEL_SERVICE, &self.service),
            (LABEL_SUBTASK_TYPE, &self.subtask_type),
            (LABEL_PIPELINE_TYPE, &self.pipeline_type),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| (name.to_owned(), value.clone()))
        .collect()
    }
}

/// Returns the DNS-1123 workload name for a subtask.
///
/// The name is `<pipeline>-<task id>-<kind>[-<service>]`, lowercased, with
/// disallowed characters replaced by `-`. Names longer than 63 characters
/// are truncated and suffixed with a short SHA-256 digest of the full name.
#[must_use]
pub fn workload_name(key: &TaskKey, kind: SubtaskKind, service: Option<&str>) -> String {
    let mut raw = format!(
        "{}-{}-{}",
        key.pipeline_name(),
        key.task_id(),
        kind.label_value()
    );
    if let Some(service_name) = service.filter(|value| !value.is_empty()) {
        raw.push('-');
        raw.push_str(service_name);
    }
    let sanitized: String = raw
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.len() <= MAX_WORKLOAD_NAME_LENGTH {
        return trimmed.to_owned();
    }

    let digest = Sha256::digest(trimmed.as_bytes());
    let suffix: String = digest
        .iter()
        .take(NAME_HASH_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    let prefix_len = MAX_WORKLOAD_NAME_LENGTH
        .saturating_sub(suffix.len())
        .saturating_sub(1);
    let prefix: String = trimmed.chars().take(prefix_len).collect();
    format!("{}-{suffix}", prefix.trim_end_matches('-'))
}

/// Returns the log file reference for a subtask.
#[must_use]
pub fn log_file_name(key: &TaskKey, kind: SubtaskKind, service: Option<&str>) -> String {
    match service.filter(|value| !value.is_empty()) {
        Some(service_name) => format!(
            "{}-{}-{}-{service_name}.log",
            key.pipeline_name(),
            key.task_id(),
            kind
        ),
        None => format!("{}-{}-{}.log", key.pipeline_name(), key.task_id(), kind),
    }
}

/// Handle of a submitted workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadHandle {
    /// Cluster running the workload.
    pub cluster: ClusterId,
    /// Namespace of the workload.
    pub namespace: String,
    /// Workload name.
    pub name: String,
}

impl fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

/// Observed phase of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Accepted but not yet scheduled.
    Pending,
    /// At least one container is running.
    Running,
    /// Completed with a zero exit code.
    Succeeded,
    /// Completed unsuccessfully.
    Failed {
        /// Container exit code, when one was reported.
        exit_code: Option<i32>,
        /// Diagnostic reason.
        reason: String,
    },
    /// Removed by the cluster without an exit code.
    Evicted {
        /// Diagnostic reason.
        reason: String,
    },
}

impl WorkloadPhase {
    /// Returns whether the workload has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Evicted { .. }
        )
    }
}

/// Deployment-wide settings used to build workload specifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadContext {
    /// Namespace workloads are created in.
    pub namespace: String,
    /// Cluster the workload is submitted to.
    pub cluster: ClusterId,
    /// Base image for job runners.
    pub reaper_image: String,
}

/// Container workload submitted to a cluster for one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Workload name.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Target cluster.
    pub cluster: ClusterId,
    /// Container image.
    pub image: String,
    /// Container arguments.
    pub args: Vec<String>,
    /// Container environment.
    pub env: Vec<EnvVar>,
    /// Workload labels.
    pub labels: BTreeMap<String, String>,
    /// Cluster-side deadline for the workload.
    pub active_deadline: Duration,
}

impl WorkloadSpec {
    /// Builds the workload specification for `subtask` of `task`.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] when the payload cannot be encoded
    /// into the workload environment.
    pub fn for_subtask(
        task: &Task,
        subtask: &Subtask,
        context: &WorkloadContext,
    ) -> Result<Self, serde_json::Error> {
        let key = task.key();
        let kind = subtask.kind();
        let service = subtask.service_name();
        let labels = WorkloadLabels::new(key, kind, service, Some(task.pipeline_type().as_str()));

        let mut env = vec![
            EnvVar::plain("TASK_ID", key.task_id().to_string()),
            EnvVar::plain("PIPELINE_NAME", key.pipeline_name().as_str()),
            EnvVar::plain("SUBTASK_TYPE", kind.as_str()),
        ];
        if let Some(service_name) = service {
            env.push(EnvVar::plain("SERVICE_NAME", service_name));
        }
        env.push(EnvVar::plain(
            "PAYLOAD",
            serde_json::to_string(subtask.payload())?,
        ));

        let (image, args) = match subtask.payload() {
            SubtaskPayload::Build(payload) => {
                env.extend(repository_env(&payload.repos));
                env.extend(payload.env_vars.iter().cloned());
                (
                    build_image(&context.reaper_image, &payload.build_os),
                    script_args(&payload.script),
                )
            }
            SubtaskPayload::Testing(payload) => {
                env.extend(repository_env(&payload.repos));
                env.extend(payload.env_vars.iter().cloned());
                (
                    build_image(&context.reaper_image, &payload.build_os),
                    script_args(&payload.script),
                )
            }
            SubtaskPayload::Deploy(payload) => {
                env.push(EnvVar::plain("ENV_NAME", payload.env_name.as_str()));
                env.push(EnvVar::plain("CONTAINER_NAME", payload.container_name.as_str()));
                env.push(EnvVar::plain("IMAGE", payload.image.as_str()));
                (context.reaper_image.clone(), vec![kind.as_str().to_owned()])
            }
            SubtaskPayload::ArtifactDeploy(payload) => {
                env.push(EnvVar::plain("ENV_NAME", payload.env_name.as_str()));
                (context.reaper_image.clone(), vec![kind.as_str().to_owned()])
            }
            SubtaskPayload::ResetImage(payload) => {
                env.push(EnvVar::plain("ENV_NAME", payload.env_name.as_str()));
                (context.reaper_image.clone(), vec![kind.as_str().to_owned()])
            }
            _ => (context.reaper_image.clone(), vec![kind.as_str().to_owned()]),
        };

        Ok(Self {
            name: workload_name(key, kind, service),
            namespace: context.namespace.clone(),
            cluster: context.cluster.clone(),
            image,
            args,
            env,
            labels: labels.to_map(),
            active_deadline: subtask.timeout(),
        })
    }

    /// Returns the handle the workload will be reachable under.
    #[must_use]
    pub fn handle(&self) -> WorkloadHandle {
        WorkloadHandle {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

fn build_image(reaper_image: &str, build_os: &str) -> String {
    if build_os.contains('/') || build_os.contains(':') {
        build_os.to_owned()
    } else {
        format!("{reaper_image}-{build_os}")
    }
}

fn script_args(script: &str) -> Vec<String> {
    if script.trim().is_empty() {
        Vec::new()
    } else {
        vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()]
    }
}

/// Derives `<REPO>_BRANCH`/`_TAG`/`_PR`/`_COMMIT_ID` variables per repository.
fn repository_env(repos: &[RepositoryRef]) -> Vec<EnvVar> {
    let mut env = Vec::new();
    for repo in repos {
        let prefix: String = repo
            .repo_name
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        if let Some(branch) = &repo.branch {
            env.push(EnvVar::plain(format!("{prefix}_BRANCH"), branch.as_str()));
        }
        if let Some(tag) = &repo.tag {
            env.push(EnvVar::plain(format!("{prefix}_TAG"), tag.as_str()));
        }
        if let Some(pr) = repo.pr {
            env.push(EnvVar::plain(format!("{prefix}_PR"), pr.to_string()));
        }
        if let Some(commit) = &repo.commit_id {
            env.push(EnvVar::plain(format!("{prefix}_COMMIT_ID"), commit.as_str()));
        }
    }
    env
}
