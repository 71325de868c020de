//! Port contracts for pipeline execution.

mod bus;
mod cluster;
mod review;
mod store;

pub use bus::{BusError, BusResult, DispatchBus, DispatchSubscription};
pub use cluster::{
    ClusterClient, ClusterError, ClusterRegistry, ClusterResult, LogOptions, LogReader,
    WorkloadSummary,
};
pub use review::{
    CommentReviewClient, ReviewClient, ReviewClientError, ReviewClientLookup,
    ReviewClientRegistry, ReviewClientResult, ReviewNotificationStore, ReviewScore,
    ScoreReviewClient,
};
pub use store::{QueueStore, StoreError, StoreResult, TaskStore};

#[cfg(test)]
pub use review::{MockCommentReviewClient, MockScoreReviewClient};
#[cfg(test)]
pub use store::{MockQueueStore, MockTaskStore};
