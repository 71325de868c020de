//! Cluster client port and the per-cluster client registry.

use crate::pipeline::domain::{ClusterId, WorkloadHandle, WorkloadPhase, WorkloadSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Byte stream of workload output.
pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Options for reading workload output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the stream open while the workload runs.
    pub follow: bool,
    /// Only return the last N lines, when set.
    pub tail_lines: Option<u64>,
}

/// Workload found by a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    /// Workload handle.
    pub handle: WorkloadHandle,
    /// Last observed phase.
    pub phase: WorkloadPhase,
}

/// Capability to run containerised workloads on one cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submits a workload.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Rejected`] when the cluster refuses the spec.
    async fn submit(&self, spec: &WorkloadSpec) -> ClusterResult<WorkloadHandle>;

    /// Returns the current phase, or `None` when the workload no longer exists.
    async fn phase(&self, handle: &WorkloadHandle) -> ClusterResult<Option<WorkloadPhase>>;

    /// Lists workloads in `namespace` carrying every label in `labels`.
    async fn find_workloads(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<WorkloadSummary>>;

    /// Opens the output stream of a workload.
    async fn logs(&self, handle: &WorkloadHandle, options: LogOptions) -> ClusterResult<LogReader>;

    /// Deletes a workload. Deleting a missing workload succeeds.
    async fn delete(&self, handle: &WorkloadHandle) -> ClusterResult<()>;
}

/// Errors returned by cluster clients.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// No client is registered for the cluster.
    #[error("unknown cluster: {0}")]
    UnknownCluster(ClusterId),

    /// The cluster refused the workload.
    #[error("workload rejected: {0}")]
    Rejected(String),

    /// Transport or API failure.
    #[error("cluster transport error: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl ClusterError {
    /// Wraps a transport error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }
}

/// Cluster clients keyed by cluster ID, with a default cluster.
#[derive(Clone)]
pub struct ClusterRegistry {
    default_cluster: ClusterId,
    clients: HashMap<ClusterId, Arc<dyn ClusterClient>>,
}

impl ClusterRegistry {
    /// Creates an empty registry falling back to `default_cluster`.
    #[must_use]
    pub fn new(default_cluster: ClusterId) -> Self {
        Self {
            default_cluster,
            clients: HashMap::new(),
        }
    }

    /// Registers the client for a cluster.
    #[must_use]
    pub fn with_client(mut self, cluster: ClusterId, client: Arc<dyn ClusterClient>) -> Self {
        self.clients.insert(cluster, client);
        self
    }

    /// Returns the default cluster ID.
    #[must_use]
    pub const fn default_cluster(&self) -> &ClusterId {
        &self.default_cluster
    }

    /// Resolves the client for an explicit cluster, or the default one.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownCluster`] when nothing is registered
    /// under the selected ID.
    pub fn resolve(
        &self,
        cluster: Option<&ClusterId>,
    ) -> ClusterResult<(ClusterId, Arc<dyn ClusterClient>)> {
        let selected = cluster.unwrap_or(&self.default_cluster);
        self.clients
            .get(selected)
            .map(|client| (selected.clone(), Arc::clone(client)))
            .ok_or_else(|| ClusterError::UnknownCluster(selected.clone()))
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("default_cluster", &self.default_cluster)
            .field("clusters", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}
