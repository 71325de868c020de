//! Subtask kinds, kind-specific payloads, and the subtask record.

use super::{
    InvalidTaskReason, ParseSubtaskKindError, Status, TaskDomainError, WorkloadHandle,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Discriminator for the closed set of subtask kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubtaskKind {
    /// Compile a service from source.
    #[serde(rename = "buildv2")]
    Build,
    /// Run a test suite.
    #[serde(rename = "testingv2")]
    Testing,
    /// Roll an image out to an environment.
    #[serde(rename = "deploy")]
    Deploy,
    /// Build and push a container image.
    #[serde(rename = "docker_build")]
    DockerBuild,
    /// Register a prebuilt artifact image.
    #[serde(rename = "artifact")]
    Artifact,
    /// Deploy a packaged artifact to hosts.
    #[serde(rename = "artifact_deploy")]
    ArtifactDeploy,
    /// Bundle images for offline delivery.
    #[serde(rename = "artifact_package")]
    ArtifactPackage,
    /// Retag and push an image to release registries.
    #[serde(rename = "release_image")]
    ReleaseImage,
    /// Copy a build product to distribution targets.
    #[serde(rename = "distribute")]
    Distribute,
    /// Update issues in an external ticket tracker.
    #[serde(rename = "jira")]
    Jira,
    /// Call an external system.
    #[serde(rename = "trigger")]
    Trigger,
    /// Scan an image for vulnerabilities.
    #[serde(rename = "security")]
    Security,
    /// Invoke a user-defined webhook extension.
    #[serde(rename = "extension")]
    Extension,
    /// Restore services to their previous images.
    #[serde(rename = "reset_image")]
    ResetImage,
    /// Delegate the build to a Jenkins job.
    #[serde(rename = "jenkins_build")]
    JenkinsBuild,
}

impl SubtaskKind {
    /// All subtask kinds.
    pub const ALL: [Self; 15] = [
        Self::Build,
        Self::Testing,
        Self::Deploy,
        Self::DockerBuild,
        Self::Artifact,
        Self::ArtifactDeploy,
        Self::ArtifactPackage,
        Self::ReleaseImage,
        Self::Distribute,
        Self::Jira,
        Self::Trigger,
        Self::Security,
        Self::Extension,
        Self::ResetImage,
        Self::JenkinsBuild,
    ];

    /// Returns the canonical (serialised) kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "buildv2",
            Self::Testing => "testingv2",
            Self::Deploy => "deploy",
            Self::DockerBuild => "docker_build",
            Self::Artifact => "artifact",
            Self::ArtifactDeploy => "artifact_deploy",
            Self::ArtifactPackage => "artifact_package",
            Self::ReleaseImage => "release_image",
            Self::Distribute => "distribute",
            Self::Jira => "jira",
            Self::Trigger => "trigger",
            Self::Security => "security",
            Self::Extension => "extension",
            Self::ResetImage => "reset_image",
            Self::JenkinsBuild => "jenkins_build",
        }
    }

    /// Returns the kind as used in workload labels and names.
    #[must_use]
    pub fn label_value(self) -> String {
        self.as_str().replace('_', "-")
    }
}

impl fmt::Display for SubtaskKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl TryFrom<&str> for SubtaskKind {
    type Error = ParseSubtaskKindError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ParseSubtaskKindError(value.to_owned()))
    }
}

/// Source repository checked out by build-like subtasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Repository name, used to derive environment variable names.
    pub repo_name: String,
    /// Branch to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Tag to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Pull/merge request number to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    /// Commit to build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
}

/// Environment variable handed to a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
    /// Whether the value is a credential and must not be logged.
    #[serde(default)]
    pub is_credential: bool,
}

impl EnvVar {
    /// Creates a plain (non-credential) variable.
    #[must_use]
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_credential: false,
        }
    }
}

/// Payload for [`SubtaskKind::Build`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPayload {
    /// Service being built.
    pub service_name: String,
    /// Build OS image tag, or a full image reference for custom images.
    pub build_os: String,
    /// Repositories to check out.
    #[serde(default)]
    pub repos: Vec<RepositoryRef>,
    /// Extra environment variables.
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    /// Build script.
    #[serde(default)]
    pub script: String,
    /// Registry receiving the output image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
}

/// Payload for [`SubtaskKind::Testing`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestingPayload {
    /// Test definition name.
    pub test_name: String,
    /// Build OS image tag, or a full image reference for custom images.
    pub build_os: String,
    /// Repositories to check out.
    #[serde(default)]
    pub repos: Vec<RepositoryRef>,
    /// Extra environment variables.
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    /// Test script.
    #[serde(default)]
    pub script: String,
}

/// Payload for [`SubtaskKind::Deploy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    /// Target environment.
    pub env_name: String,
    /// Service being deployed.
    pub service_name: String,
    /// Container to update.
    pub container_name: String,
    /// Image to roll out.
    pub image: String,
}

/// Payload for [`SubtaskKind::DockerBuild`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBuildPayload {
    /// Service whose image is built.
    pub service_name: String,
    /// Image reference to produce.
    pub image: String,
    /// Registry receiving the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
    /// Dockerfile path inside the workspace.
    #[serde(default)]
    pub dockerfile: String,
    /// Build context directory.
    #[serde(default)]
    pub build_context: String,
}

/// Payload for [`SubtaskKind::Artifact`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    /// Service the artifact belongs to.
    pub service_name: String,
    /// Artifact image reference.
    pub image: String,
    /// Registry holding the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
}

/// Payload for [`SubtaskKind::ArtifactDeploy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDeployPayload {
    /// Target environment.
    pub env_name: String,
    /// Service being deployed.
    pub service_name: String,
    /// Path of the packaged artifact.
    pub artifact_path: String,
}

/// Payload for [`SubtaskKind::ArtifactPackage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPackagePayload {
    /// Images to bundle.
    #[serde(default)]
    pub images: Vec<String>,
    /// Registries receiving the bundle.
    #[serde(default)]
    pub target_registries: Vec<String>,
}

/// Payload for [`SubtaskKind::ReleaseImage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseImagePayload {
    /// Service the image belongs to.
    #[serde(default)]
    pub service_name: String,
    /// Image to release.
    pub source_image: String,
    /// Release image references.
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Payload for [`SubtaskKind::Distribute`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributePayload {
    /// Package produced by an earlier build.
    pub package_file: String,
    /// Distribution destinations.
    #[serde(default)]
    pub destinations: Vec<String>,
}

/// Issue referenced by a [`SubtaskKind::Jira`] subtask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraIssue {
    /// Issue key, e.g. `OPS-12`.
    pub key: String,
    /// Issue summary.
    #[serde(default)]
    pub summary: String,
    /// Browser URL of the issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Payload for [`SubtaskKind::Jira`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraPayload {
    /// Issues to update.
    #[serde(default)]
    pub issues: Vec<JiraIssue>,
}

/// Payload for [`SubtaskKind::Trigger`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    /// Endpoint of the external system.
    pub url: String,
    /// Request body forwarded to the external system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Payload for [`SubtaskKind::Security`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPayload {
    /// Image to scan.
    pub image: String,
}

/// Payload for [`SubtaskKind::Extension`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPayload {
    /// Webhook URL.
    pub url: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Payload for [`SubtaskKind::ResetImage`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetImagePayload {
    /// Environment to restore.
    pub env_name: String,
    /// Services to restore.
    #[serde(default)]
    pub services: Vec<String>,
}

/// Payload for [`SubtaskKind::JenkinsBuild`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JenkinsBuildPayload {
    /// Service being built.
    #[serde(default)]
    pub service_name: String,
    /// Jenkins job name.
    pub job_name: String,
    /// Job parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Kind-specific subtask payload, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SubtaskPayload {
    /// Build payload.
    #[serde(rename = "buildv2")]
    Build(BuildPayload),
    /// Testing payload.
    #[serde(rename = "testingv2")]
    Testing(TestingPayload),
    /// Deploy payload.
    #[serde(rename = "deploy")]
    Deploy(DeployPayload),
    /// Docker build payload.
    #[serde(rename = "docker_build")]
    DockerBuild(DockerBuildPayload),
    /// Artifact payload.
    #[serde(rename = "artifact")]
    Artifact(ArtifactPayload),
    /// Artifact deploy payload.
    #[serde(rename = "artifact_deploy")]
    ArtifactDeploy(ArtifactDeployPayload),
    /// Artifact package payload.
    #[serde(rename = "artifact_package")]
    ArtifactPackage(ArtifactPackagePayload),
    /// Release image payload.
    #[serde(rename = "release_image")]
    ReleaseImage(ReleaseImagePayload),
    /// Distribute payload.
    #[serde(rename = "distribute")]
    Distribute(DistributePayload),
    /// Jira payload.
    #[serde(rename = "jira")]
    Jira(JiraPayload),
    /// Trigger payload.
    #[serde(rename = "trigger")]
    Trigger(TriggerPayload),
    /// Security scan payload.
    #[serde(rename = "security")]
    Security(SecurityPayload),
    /// Extension payload.
    #[serde(rename = "extension")]
    Extension(ExtensionPayload),
    /// Reset image payload.
    #[serde(rename = "reset_image")]
    ResetImage(ResetImagePayload),
    /// Jenkins build payload.
    #[serde(rename = "jenkins_build")]
    JenkinsBuild(JenkinsBuildPayload),
}

impl SubtaskPayload {
    /// Returns the kind discriminator of this payload.
    #[must_use]
    pub const fn kind(&self) -> SubtaskKind {
        match self {
            Self::Build(_) => SubtaskKind::Build,
            Self::Testing(_) => SubtaskKind::Testing,
            Self::Deploy(_) => SubtaskKind::Deploy,
            Self::DockerBuild(_) => SubtaskKind::DockerBuild,
            Self::Artifact(_) => SubtaskKind::Artifact,
            Self::ArtifactDeploy(_) => SubtaskKind::ArtifactDeploy,
            Self::ArtifactPackage(_) => SubtaskKind::ArtifactPackage,
            Self::ReleaseImage(_) => SubtaskKind::ReleaseImage,
            Self::Distribute(_) => SubtaskKind::Distribute,
            Self::Jira(_) => SubtaskKind::Jira,
            Self::Trigger(_) => SubtaskKind::Trigger,
            Self::Security(_) => SubtaskKind::Security,
            Self::Extension(_) => SubtaskKind::Extension,
            Self::ResetImage(_) => SubtaskKind::ResetImage,
            Self::JenkinsBuild(_) => SubtaskKind::JenkinsBuild,
        }
    }

    /// Returns the service this payload acts on, when it names one.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        let name = match self {
            Self::Build(payload) => payload.service_name.as_str(),
            Self::Testing(payload) => payload.test_name.as_str(),
            Self::Deploy(payload) => payload.service_name.as_str(),
            Self::DockerBuild(payload) => payload.service_name.as_str(),
            Self::Artifact(payload) => payload.service_name.as_str(),
            Self::ArtifactDeploy(payload) => payload.service_name.as_str(),
            Self::ReleaseImage(payload) => payload.service_name.as_str(),
            Self::JenkinsBuild(payload) => payload.service_name.as_str(),
            Self::ArtifactPackage(_)
            | Self::Distribute(_)
            | Self::Jira(_)
            | Self::Trigger(_)
            | Self::Security(_)
            | Self::Extension(_)
            | Self::ResetImage(_) => "",
        };
        Some(name).filter(|value| !value.is_empty())
    }
}

/// One typed step inside a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(flatten)]
    payload: SubtaskPayload,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    status: Status,
    #[serde(default)]
    timeout_secs: u64,
    #[serde(default)]
    cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_file: Option<String>,
    #[serde(default)]
    is_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workload: Option<WorkloadHandle>,
}

const fn enabled_by_default() -> bool {
    true
}

const fn whole_seconds_rounded_up(timeout: Duration) -> u64 {
    if timeout.subsec_nanos() == 0 {
        timeout.as_secs()
    } else {
        timeout.as_secs().saturating_add(1)
    }
}

impl Subtask {
    /// Creates an enabled subtask with the given payload and timeout.
    ///
    /// Timeouts are kept in whole seconds; a fractional second rounds up.
    #[must_use]
    pub const fn new(payload: SubtaskPayload, timeout: Duration) -> Self {
        Self {
            payload,
            enabled: true,
            status: Status::Created,
            timeout_secs: whole_seconds_rounded_up(timeout),
            cleanup: false,
            error: None,
            start_time: None,
            end_time: None,
            log_file: None,
            is_restart: false,
            workload: None,
        }
    }

    /// Parses an untyped subtask map carrying a `type` discriminator.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDomainError::InvalidTask`] when the `type` field is
    /// missing or unknown, or when the payload does not match its kind.
    pub fn from_value(index: usize, value: Value) -> Result<Self, TaskDomainError> {
        let raw_kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(TaskDomainError::InvalidTask(
                InvalidTaskReason::MissingSubtaskKind { index },
            ))?
            .to_owned();
        let kind = SubtaskKind::try_from(raw_kind.as_str()).map_err(|_| {
            TaskDomainError::InvalidTask(InvalidTaskReason::UnknownSubtaskKind {
                index,
                kind: raw_kind.clone(),
            })
        })?;
        serde_json::from_value(value).map_err(|err| {
            TaskDomainError::InvalidTask(InvalidTaskReason::MalformedSubtask {
                index,
                kind,
                reason: err.to_string(),
            })
        })
    }

    /// Disables the subtask; it will be recorded as skipped.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Marks the subtask as a cleanup step.
    #[must_use]
    pub const fn as_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    /// Returns whether `other` describes the same step, ignoring execution
    /// state.
    #[must_use]
    pub fn has_same_definition(&self, other: &Self) -> bool {
        self.payload == other.payload
            && self.enabled == other.enabled
            && self.cleanup == other.cleanup
            && self.timeout_secs == other.timeout_secs
    }

    /// Returns the kind discriminator.
    #[must_use]
    pub const fn kind(&self) -> SubtaskKind {
        self.payload.kind()
    }

    /// Returns the kind-specific payload.
    #[must_use]
    pub const fn payload(&self) -> &SubtaskPayload {
        &self.payload
    }

    /// Returns the service this subtask acts on, if any.
    #[must_use]
    pub fn service_name(&self) -> Option<&str> {
        self.payload.service_name()
    }

    /// Returns whether the subtask is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns whether the subtask is a cleanup step.
    #[must_use]
    pub const fn is_cleanup(&self) -> bool {
        self.cleanup
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Returns the configured wall-clock budget.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the recorded error message, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns when execution started.
    #[must_use]
    pub const fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    /// Returns when execution finished.
    #[must_use]
    pub const fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Returns the log file reference, if recorded.
    #[must_use]
    pub fn log_file(&self) -> Option<&str> {
        self.log_file.as_deref()
    }

    /// Returns whether this execution is a restart after redelivery.
    #[must_use]
    pub const fn is_restart(&self) -> bool {
        self.is_restart
    }

    /// Returns the handle of the submitted workload, if any.
    #[must_use]
    pub const fn workload(&self) -> Option<&WorkloadHandle> {
        self.workload.as_ref()
    }

    pub(super) const fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(super) fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub(super) const fn set_start_time(&mut self, at: DateTime<Utc>) {
        self.start_time = Some(at);
    }

    pub(super) const fn set_end_time(&mut self, at: DateTime<Utc>) {
        self.end_time = Some(at);
    }

    pub(super) fn set_log_file(&mut self, log_file: String) {
        self.log_file = Some(log_file);
    }

    pub(super) const fn mark_restart(&mut self) {
        self.is_restart = true;
    }

    pub(super) fn set_workload(&mut self, workload: Option<WorkloadHandle>) {
        self.workload = workload;
    }

    pub(super) fn reset_error(&mut self) {
        self.error = None;
    }
}
