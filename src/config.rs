//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Durations are expressed in milliseconds.

use crate::pipeline::domain::{ClusterId, PipelineType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CLUSTER: &str = "local";
const DEFAULT_NAMESPACE: &str = "pipewright";
const DEFAULT_REAPER_IMAGE: &str = "pipewright/reaper";
const DEFAULT_REVIEW_BASE_URI: &str = "http://localhost:8080";

/// What happens to the remaining subtasks after one of them fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every remaining subtask.
    #[default]
    FailFast,
    /// Skip remaining subtasks except those flagged as cleanup.
    RunCleanup,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// A duration or count that must be positive is zero.
    #[error("configuration field `{0}` must be greater than zero")]
    Zero(&'static str),

    /// A text field that must be set is empty.
    #[error("configuration field `{0}` must not be empty")]
    Empty(&'static str),
}

/// Settings shared by the dispatch, execution, and feedback services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cluster used when a task names none.
    pub default_cluster: String,
    /// Namespace workloads are created in.
    pub namespace: String,
    /// Interval between claim heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Heartbeats a worker may miss before its claim is redelivered.
    pub missed_heartbeats: u32,
    /// Interval between workload status polls.
    pub poll_interval_ms: u64,
    /// Longest wait for a workload to start before a log stream gives up.
    pub log_wait_ceiling_ms: u64,
    /// First back-off after a failed claim.
    pub claim_retry_initial_backoff_ms: u64,
    /// Upper bound for the claim back-off.
    pub claim_retry_max_backoff_ms: u64,
    /// Claim attempts before the error is surfaced to the worker.
    pub claim_max_retries: u32,
    /// Interval between lease reaper sweeps.
    pub reaper_interval_ms: u64,
    /// Base URI used to link review comments back to task pages.
    pub review_base_uri: String,
    /// Failure policy per pipeline type; missing types use fail-fast.
    pub failure_policies: BTreeMap<PipelineType, FailurePolicy>,
    /// Job-runner image prefix for build-like subtasks.
    pub reaper_image: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cluster: DEFAULT_CLUSTER.to_owned(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            heartbeat_interval_ms: 10_000,
            missed_heartbeats: 3,
            poll_interval_ms: 1_000,
            log_wait_ceiling_ms: 300_000,
            claim_retry_initial_backoff_ms: 100,
            claim_retry_max_backoff_ms: 5_000,
            claim_max_retries: 5,
            reaper_interval_ms: 5_000,
            review_base_uri: DEFAULT_REVIEW_BASE_URI.to_owned(),
            failure_policies: BTreeMap::new(),
            reaper_image: DEFAULT_REAPER_IMAGE.to_owned(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the document is malformed or fails
    /// [`EngineConfig::validate`].
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that intervals and counts are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] for zero intervals or counts and
    /// [`ConfigError::Empty`] for blank names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("missed_heartbeats", u64::from(self.missed_heartbeats)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("log_wait_ceiling_ms", self.log_wait_ceiling_ms),
            (
                "claim_retry_initial_backoff_ms",
                self.claim_retry_initial_backoff_ms,
            ),
            ("claim_retry_max_backoff_ms", self.claim_retry_max_backoff_ms),
            ("reaper_interval_ms", self.reaper_interval_ms),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(field));
        }
        let named = [
            ("default_cluster", &self.default_cluster),
            ("namespace", &self.namespace),
            ("reaper_image", &self.reaper_image),
        ];
        if let Some((field, _)) = named.into_iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::Empty(field));
        }
        Ok(())
    }

    /// Sets the default cluster.
    #[must_use]
    pub fn with_default_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.default_cluster = cluster.into();
        self
    }

    /// Sets the workload namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the heartbeat interval and the number of heartbeats that may be
    /// missed.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, missed: u32) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self.missed_heartbeats = missed;
        self
    }

    /// Sets the workload poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    /// Sets the log wait ceiling.
    #[must_use]
    pub fn with_log_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.log_wait_ceiling_ms = millis(ceiling);
        self
    }

    /// Sets the claim back-off bounds and retry budget.
    #[must_use]
    pub fn with_claim_retry(mut self, initial: Duration, max: Duration, retries: u32) -> Self {
        self.claim_retry_initial_backoff_ms = millis(initial);
        self.claim_retry_max_backoff_ms = millis(max);
        self.claim_max_retries = retries;
        self
    }

    /// Sets the lease reaper interval.
    #[must_use]
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval_ms = millis(interval);
        self
    }

    /// Sets the base URI for review comment links.
    #[must_use]
    pub fn with_review_base_uri(mut self, uri: impl Into<String>) -> Self {
        self.review_base_uri = uri.into();
        self
    }

    /// Sets the failure policy of a pipeline type.
    #[must_use]
    pub fn with_failure_policy(mut self, pipeline_type: PipelineType, policy: FailurePolicy) -> Self {
        self.failure_policies.insert(pipeline_type, policy);
        self
    }

    /// Sets the job-runner image prefix.
    #[must_use]
    pub fn with_reaper_image(mut self, image: impl Into<String>) -> Self {
        self.reaper_image = image.into();
        self
    }

    /// Returns the default cluster ID.
    #[must_use]
    pub fn default_cluster_id(&self) -> ClusterId {
        ClusterId::new(self.default_cluster.as_str())
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Returns the claim lease window: heartbeat interval times missed
    /// heartbeats.
    #[must_use]
    pub fn lease_window(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.missed_heartbeats)),
        )
    }

    /// Returns the workload poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the log wait ceiling.
    #[must_use]
    pub const fn log_wait_ceiling(&self) -> Duration {
        Duration::from_millis(self.log_wait_ceiling_ms)
    }

    /// Returns the first claim back-off.
    #[must_use]
    pub const fn claim_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_retry_initial_backoff_ms)
    }

    /// Returns the largest claim back-off.
    #[must_use]
    pub const fn claim_max_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_retry_max_backoff_ms)
    }

    /// Returns the lease reaper interval.
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// Returns the failure policy of a pipeline type.
    #[must_use]
    pub fn failure_policy(&self, pipeline_type: PipelineType) -> FailurePolicy {
        self.failure_policies
            .get(&pipeline_type)
            .copied()
            .unwrap_or_default()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
