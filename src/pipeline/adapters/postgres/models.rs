//! Diesel row models for pipeline persistence.

use super::schema::{dispatch_queue, pipeline_tasks, review_notifications};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

/// Query result row for task documents.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = pipeline_tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskRow {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Task number.
    pub task_id: i64,
    /// Denormalised status.
    pub status: String,
    /// Task document.
    pub document: Value,
    /// Optimistic-concurrency version.
    pub version: i64,
}

/// Insert model for task documents.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pipeline_tasks)]
pub struct NewTaskRow {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Task number.
    pub task_id: i64,
    /// Denormalised status.
    pub status: String,
    /// Task document.
    pub document: Value,
    /// Initial version.
    pub version: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Query result row for queue entries.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = dispatch_queue)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct QueueEntryRow {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Task number.
    pub task_id: i64,
    /// Dispatch state.
    pub state: String,
    /// Claiming worker.
    pub worker_id: Option<String>,
    /// End of the current lease.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Cancellation flag.
    pub cancel_requested: bool,
    /// Claim count.
    pub attempts: i32,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
}

/// Insert model for queue entries.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = dispatch_queue)]
pub struct NewQueueEntryRow {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Task number.
    pub task_id: i64,
    /// Dispatch state.
    pub state: String,
    /// Claiming worker.
    pub worker_id: Option<String>,
    /// End of the current lease.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Cancellation flag.
    pub cancel_requested: bool,
    /// Claim count.
    pub attempts: i32,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
}

/// Row for review notification documents.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = review_notifications)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ReviewNotificationRow {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Task number.
    pub task_id: i64,
    /// Notification document.
    pub document: Value,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}
