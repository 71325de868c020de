//! Code-review linkage and the review notification record.

use super::{Status, TaskKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Originating code-review request of a task triggered by a review event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewRef {
    /// Configured code host identifier.
    pub code_host_id: u64,
    /// Project (repository) path on the code host.
    pub project_id: String,
    /// Merge request or change number.
    pub change_id: u64,
    /// Patch-set revision, for score-style review systems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ReviewRef {
    /// Creates a review reference without a revision.
    #[must_use]
    pub fn new(code_host_id: u64, project_id: impl Into<String>, change_id: u64) -> Self {
        Self {
            code_host_id,
            project_id: project_id.into(),
            change_id,
            revision: None,
        }
    }

    /// Sets the patch-set revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

impl fmt::Display for ReviewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host {}: {}!{}",
            self.code_host_id, self.project_id, self.change_id
        )
    }
}

/// Association between a task and the comment mirrored onto its review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewNotification {
    key: TaskKey,
    review: ReviewRef,
    comment_id: Option<String>,
    first_commented: bool,
    last_status: Option<Status>,
    updated_at: DateTime<Utc>,
}

impl ReviewNotification {
    /// Creates a notification record that has not posted anything yet.
    #[must_use]
    pub const fn new(key: TaskKey, review: ReviewRef, created_at: DateTime<Utc>) -> Self {
        Self {
            key,
            review,
            comment_id: None,
            first_commented: false,
            last_status: None,
            updated_at: created_at,
        }
    }

    /// Returns the task this notification belongs to.
    #[must_use]
    pub const fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Returns the review request.
    #[must_use]
    pub const fn review(&self) -> &ReviewRef {
        &self.review
    }

    /// Returns the identifier of the comment to update in place.
    #[must_use]
    pub fn comment_id(&self) -> Option<&str> {
        self.comment_id.as_deref()
    }

    /// Returns whether the initial comment has been posted.
    #[must_use]
    pub const fn first_commented(&self) -> bool {
        self.first_commented
    }

    /// Returns the last status mirrored onto the review.
    #[must_use]
    pub const fn last_status(&self) -> Option<Status> {
        self.last_status
    }

    /// Returns when the record last changed.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Records a posted comment and the status it reflects.
    ///
    /// `at` is the time of the task change being reported.
    pub fn record_comment(&mut self, comment_id: Option<String>, status: Status, at: DateTime<Utc>) {
        if comment_id.is_some() {
            self.comment_id = comment_id;
        }
        self.first_commented = true;
        self.last_status = Some(status);
        self.updated_at = at;
    }
}
