//! Code-review client ports and the per-code-host client registry.

use super::StoreResult;
use crate::pipeline::domain::{ReviewNotification, ReviewRef, TaskKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for review client operations.
pub type ReviewClientResult<T> = Result<T, ReviewClientError>;

/// Score attached to a review by score-style review systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewScore {
    /// Approve (`+1`).
    Positive,
    /// No opinion (`0`).
    Neutral,
    /// Reject (`-1`).
    Negative,
}

impl ReviewScore {
    /// Returns the label value sent to the review system.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "+1",
            Self::Neutral => "0",
            Self::Negative => "-1",
        }
    }
}

impl fmt::Display for ReviewScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review system that supports editing comments in place.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommentReviewClient: Send + Sync {
    /// Posts a comment and returns its identifier.
    async fn create_comment(&self, review: &ReviewRef, body: &str) -> ReviewClientResult<String>;

    /// Replaces the body of an existing comment.
    async fn update_comment(
        &self,
        review: &ReviewRef,
        comment_id: &str,
        body: &str,
    ) -> ReviewClientResult<()>;
}

/// Review system that records scored reviews.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScoreReviewClient: Send + Sync {
    /// Posts a review message with a score.
    async fn set_review(
        &self,
        review: &ReviewRef,
        message: &str,
        score: ReviewScore,
    ) -> ReviewClientResult<()>;
}

/// Persistence for review notification records.
#[async_trait]
pub trait ReviewNotificationStore: Send + Sync {
    /// Finds the notification record of a task.
    async fn find_notification(&self, key: &TaskKey) -> StoreResult<Option<ReviewNotification>>;

    /// Inserts or replaces a notification record.
    async fn save_notification(&self, notification: &ReviewNotification) -> StoreResult<()>;
}

/// Errors returned by review clients.
#[derive(Debug, Clone, Error)]
pub enum ReviewClientError {
    /// The review system refused the request.
    #[error("review system rejected request: {0}")]
    Rejected(String),

    /// Transport failure.
    #[error("review transport error: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl ReviewClientError {
    /// Wraps a transport error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }
}

/// Capability shape of a connected review system.
#[derive(Clone)]
pub enum ReviewClient {
    /// Comment-edit system (`gitlab`).
    Comment(Arc<dyn CommentReviewClient>),
    /// Review-score system (`gerrit`).
    Score(Arc<dyn ScoreReviewClient>),
}

impl fmt::Debug for ReviewClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comment(_) => f.write_str("ReviewClient::Comment"),
            Self::Score(_) => f.write_str("ReviewClient::Score"),
        }
    }
}

#[derive(Debug, Clone)]
enum CodeHost {
    Supported(ReviewClient),
    Unsupported(String),
}

/// Outcome of looking up the client for a code host.
#[derive(Debug, Clone)]
pub enum ReviewClientLookup {
    /// A supported client.
    Found(ReviewClient),
    /// The code host is connected but its system kind is not supported.
    Unsupported(String),
    /// Nothing is registered for the code host.
    Unknown,
}

/// Review clients keyed by code host ID.
#[derive(Debug, Clone, Default)]
pub struct ReviewClientRegistry {
    hosts: HashMap<u64, CodeHost>,
}

impl ReviewClientRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `gitlab` code host.
    #[must_use]
    pub fn with_gitlab(mut self, code_host_id: u64, client: Arc<dyn CommentReviewClient>) -> Self {
        self.hosts.insert(
            code_host_id,
            CodeHost::Supported(ReviewClient::Comment(client)),
        );
        self
    }

    /// Registers a `gerrit` code host.
    #[must_use]
    pub fn with_gerrit(mut self, code_host_id: u64, client: Arc<dyn ScoreReviewClient>) -> Self {
        self.hosts.insert(
            code_host_id,
            CodeHost::Supported(ReviewClient::Score(client)),
        );
        self
    }

    /// Registers a code host of a kind without review feedback support.
    #[must_use]
    pub fn with_unsupported(mut self, code_host_id: u64, kind: impl Into<String>) -> Self {
        self.hosts
            .insert(code_host_id, CodeHost::Unsupported(kind.into()));
        self
    }

    /// Looks up the client for a code host.
    #[must_use]
    pub fn lookup(&self, code_host_id: u64) -> ReviewClientLookup {
        match self.hosts.get(&code_host_id) {
            Some(CodeHost::Supported(client)) => ReviewClientLookup::Found(client.clone()),
            Some(CodeHost::Unsupported(kind)) => ReviewClientLookup::Unsupported(kind.clone()),
            None => ReviewClientLookup::Unknown,
        }
    }
}
