//! Mirrors task status onto the originating code-review request.

use crate::pipeline::{
    domain::{ReviewNotification, Status, Task},
    ports::{
        ReviewClient, ReviewClientError, ReviewClientLookup, ReviewClientRegistry,
        ReviewNotificationStore, ReviewScore, StoreError,
    },
};
use minijinja::Environment;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const COMMENT_TEMPLATE: &str = "\
|Pipeline|Task|Status|
|---|---|---|
|{{ pipeline }}|[#{{ task_id }}]({{ link }})|{{ status }}|

{% for step in subtasks %}- {{ step.kind }}{% if step.service %} ({{ step.service }}){% endif %}: {{ step.status }}
{% endfor %}";

/// Errors raised while mirroring status onto a review.
#[derive(Debug, Error)]
pub enum ReviewFeedbackError {
    /// The connected review system has no feedback support.
    #[error("unsupported review system `{0}`")]
    UnsupportedScm(String),

    /// No review system is registered for the code host.
    #[error("no review system registered for code host {0}")]
    UnknownCodeHost(u64),

    /// The review system call failed.
    #[error(transparent)]
    Client(#[from] ReviewClientError),

    /// The notification record could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The comment template failed to render.
    #[error("failed to render review comment: {0}")]
    Render(String),
}

/// Result type for review feedback operations.
pub type ReviewFeedbackResult<T> = Result<T, ReviewFeedbackError>;

/// What a feedback call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// The task is not linked to a review.
    NotLinked,
    /// Nothing new to report.
    Unchanged,
    /// A comment was created.
    Commented,
    /// The existing comment was updated in place.
    Updated,
    /// A scored review was posted.
    Scored(ReviewScore),
}

/// SCM feedback service.
#[derive(Clone)]
pub struct ScmFeedbackService {
    registry: ReviewClientRegistry,
    notifications: Arc<dyn ReviewNotificationStore>,
    base_uri: String,
}

impl ScmFeedbackService {
    /// Creates a feedback service linking comments under `base_uri`.
    #[must_use]
    pub fn new(
        registry: ReviewClientRegistry,
        notifications: Arc<dyn ReviewNotificationStore>,
        base_uri: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            notifications,
            base_uri: base_uri.into(),
        }
    }

    /// Mirrors the current status of `task` onto its review request.
    ///
    /// Comment-style systems get one comment that is edited in place.
    /// Score-style systems get a neutral message when the task starts and a
    /// scored message once it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`ReviewFeedbackError::UnsupportedScm`] for review systems
    /// without feedback support, or the underlying client or store error.
    pub async fn notify(&self, task: &Task) -> ReviewFeedbackResult<FeedbackOutcome> {
        let Some(review) = task.review() else {
            return Ok(FeedbackOutcome::NotLinked);
        };
        let status = task.status();
        if !(status.is_terminal() || matches!(status, Status::Queued | Status::Running)) {
            return Ok(FeedbackOutcome::Unchanged);
        }
        let client = match self.registry.lookup(review.code_host_id) {
            ReviewClientLookup::Found(found) => found,
            ReviewClientLookup::Unsupported(kind) => {
                return Err(ReviewFeedbackError::UnsupportedScm(kind));
            }
            ReviewClientLookup::Unknown => {
                return Err(ReviewFeedbackError::UnknownCodeHost(review.code_host_id));
            }
        };

        let mut notification = self
            .notifications
            .find_notification(task.key())
            .await?
            .unwrap_or_else(|| {
                ReviewNotification::new(task.key().clone(), review.clone(), task.created_at())
            });

        let outcome = match client {
            ReviewClient::Comment(comments) => {
                let body = self.render_comment(task)?;
                if let Some(comment_id) = notification.comment_id().map(str::to_owned) {
                    comments.update_comment(review, &comment_id, &body).await?;
                    notification.record_comment(None, status, task.updated_at());
                    FeedbackOutcome::Updated
                } else {
                    let comment_id = comments.create_comment(review, &body).await?;
                    notification.record_comment(Some(comment_id), status, task.updated_at());
                    FeedbackOutcome::Commented
                }
            }
            ReviewClient::Score(scores) => {
                let repeated = notification.last_status() == Some(status);
                let started = notification.first_commented() && !status.is_terminal();
                if repeated || started {
                    return Ok(FeedbackOutcome::Unchanged);
                }
                let (score, marker) = score_for(status);
                let message = format!(
                    "{} {marker} {}",
                    status.as_str().to_uppercase(),
                    self.task_link(task)
                );
                scores.set_review(review, &message, score).await?;
                notification.record_comment(None, status, task.updated_at());
                FeedbackOutcome::Scored(score)
            }
        };

        self.notifications.save_notification(&notification).await?;
        debug!(task = %task.key(), review = %review, ?outcome, "review feedback posted");
        Ok(outcome)
    }

    /// Calls [`ScmFeedbackService::notify`] and logs failures.
    pub async fn notify_best_effort(&self, task: &Task) {
        if let Err(err) = self.notify(task).await {
            warn!(task = %task.key(), status = %task.status(), error = %err, "review feedback failed");
        }
    }

    fn task_link(&self, task: &Task) -> String {
        let key = task.key();
        format!(
            "{}/pipelines/{}/tasks/{}",
            self.base_uri.trim_end_matches('/'),
            key.pipeline_name(),
            key.task_id()
        )
    }

    fn render_comment(&self, task: &Task) -> ReviewFeedbackResult<String> {
        let subtasks: Vec<_> = task
            .subtasks()
            .iter()
            .map(|subtask| {
                json!({
                    "kind": subtask.kind().as_str(),
                    "service": subtask.service_name(),
                    "status": subtask.status().as_str(),
                })
            })
            .collect();
        let context = json!({
            "pipeline": task.key().pipeline_name().as_str(),
            "task_id": task.key().task_id().value(),
            "link": self.task_link(task),
            "status": task.status().as_str(),
            "subtasks": subtasks,
        });
        Environment::new()
            .render_str(COMMENT_TEMPLATE, context)
            .map_err(|err| ReviewFeedbackError::Render(err.to_string()))
    }
}

const fn score_for(status: Status) -> (ReviewScore, &'static str) {
    match status {
        Status::Passed => (ReviewScore::Positive, "✅"),
        Status::Failed | Status::Timeout => (ReviewScore::Negative, "❌"),
        Status::Cancelled => (ReviewScore::Neutral, "✖️"),
        _ => (ReviewScore::Neutral, "⏱️"),
    }
}
