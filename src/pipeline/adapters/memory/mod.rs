//! In-memory adapters for tests and single-process embedding.

mod bus;
mod cluster;
mod review;
mod store;

pub use bus::InMemoryDispatchBus;
pub use cluster::{InMemoryCluster, ScriptedOutcome, WorkloadScript};
pub use review::InMemoryReviewNotificationStore;
pub use store::InMemoryPipelineStore;
