//! `PostgreSQL` implementation of the pipeline store ports.

use super::{
    models::{NewQueueEntryRow, NewTaskRow, QueueEntryRow, ReviewNotificationRow, TaskRow},
    schema::{dispatch_queue, pipeline_counters, pipeline_tasks, review_notifications},
};
use crate::pipeline::{
    domain::{
        DispatchState, PersistedQueueEntry, PipelineName, QueueEntry, ReviewNotification, Task,
        TaskId, TaskKey, WorkerId,
    },
    ports::{QueueStore, ReviewNotificationStore, StoreError, StoreResult, TaskStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::upsert::excluded;
use thiserror::Error;

/// `PostgreSQL` connection pool type used by pipeline adapters.
pub type PipelinePgPool = Pool<ConnectionManager<PgConnection>>;

/// `PostgreSQL`-backed task, queue, and review notification store.
#[derive(Debug, Clone)]
pub struct PostgresPipelineStore {
    pool: PipelinePgPool,
}

/// Stored values that cannot be mapped back onto domain types.
#[derive(Debug, Error)]
pub enum RowConversionError {
    /// The dispatch state column holds an unknown value.
    #[error("unknown dispatch state '{0}'")]
    UnknownDispatchState(String),

    /// The key or status columns disagree with the stored document.
    #[error("columns of {0} disagree with its document")]
    DocumentMismatch(TaskKey),

    /// A numeric column holds a value outside the domain range.
    #[error("column {column} holds out-of-range value {value}")]
    OutOfRange {
        /// Column name.
        column: &'static str,
        /// Stored value.
        value: i64,
    },
}

impl PostgresPipelineStore {
    /// Creates a new store from a `PostgreSQL` connection pool.
    #[must_use]
    pub const fn new(pool: PipelinePgPool) -> Self {
        Self { pool }
    }

    async fn run_blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = pool.get().map_err(StoreError::unavailable)?;
            f(&mut connection)
        })
        .await
        .map_err(StoreError::unavailable)?
    }
}

#[async_trait]
impl TaskStore for PostgresPipelineStore {
    async fn next_task_id(&self, pipeline: &PipelineName) -> StoreResult<TaskId> {
        let name = pipeline.as_str().to_owned();
        let last = self
            .run_blocking(move |connection| {
                diesel::insert_into(pipeline_counters::table)
                    .values((
                        pipeline_counters::pipeline_name.eq(&name),
                        pipeline_counters::last_task_id.eq(1_i64),
                    ))
                    .on_conflict(pipeline_counters::pipeline_name)
                    .do_update()
                    .set(pipeline_counters::last_task_id.eq(pipeline_counters::last_task_id + 1))
                    .returning(pipeline_counters::last_task_id)
                    .get_result::<i64>(connection)
                    .map_err(query_error)
            })
            .await?;
        let value = column_to_u64("last_task_id", last)?;
        TaskId::new(value).map_err(StoreError::persistence)
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<Task> {
        let stored = task.clone().with_version(1);
        let row = to_new_task_row(&stored)?;
        let key = task.key().clone();
        self.run_blocking(move |connection| {
            diesel::insert_into(pipeline_tasks::table)
                .values(&row)
                .execute(connection)
                .map_err(|err| match err {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        StoreError::Duplicate(key.clone())
                    }
                    _ => query_error(err),
                })?;
            Ok(())
        })
        .await?;
        Ok(stored)
    }

    async fn find_task(&self, key: &TaskKey) -> StoreResult<Option<Task>> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            let row = pipeline_tasks::table
                .find((name, id))
                .select(TaskRow::as_select())
                .first::<TaskRow>(connection)
                .optional()
                .map_err(query_error)?;
            row.map(row_to_task).transpose()
        })
        .await
    }

    async fn update_task(&self, task: &Task) -> StoreResult<Task> {
        let (name, id) = key_columns(task.key())?;
        let expected = task.version();
        let stored = task.clone().with_version(expected.saturating_add(1));
        let expected_column = u64_to_column(expected)?;
        let next_column = u64_to_column(stored.version())?;
        let document = serde_json::to_value(&stored).map_err(StoreError::persistence)?;
        let status = stored.status().as_str().to_owned();
        let updated_at = stored.updated_at();
        let key = task.key().clone();

        self.run_blocking(move |connection| {
            let updated = diesel::update(
                pipeline_tasks::table
                    .find((name.clone(), id))
                    .filter(pipeline_tasks::version.eq(expected_column)),
            )
            .set((
                pipeline_tasks::status.eq(status),
                pipeline_tasks::document.eq(document),
                pipeline_tasks::version.eq(next_column),
                pipeline_tasks::updated_at.eq(updated_at),
            ))
            .execute(connection)
            .map_err(query_error)?;
            if updated > 0 {
                return Ok(());
            }

            let exists = diesel::select(diesel::dsl::exists(
                pipeline_tasks::table.find((name, id)),
            ))
            .get_result::<bool>(connection)
            .map_err(query_error)?;
            if exists {
                Err(StoreError::VersionConflict { key, expected })
            } else {
                Err(StoreError::NotFound(key))
            }
        })
        .await?;
        Ok(stored)
    }
}

#[async_trait]
impl QueueStore for PostgresPipelineStore {
    async fn insert_entry(&self, entry: &QueueEntry) -> StoreResult<()> {
        let row = to_new_entry_row(entry)?;
        let key = entry.key().clone();
        self.run_blocking(move |connection| {
            diesel::insert_into(dispatch_queue::table)
                .values(&row)
                .execute(connection)
                .map_err(|err| match err {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        StoreError::Duplicate(key.clone())
                    }
                    _ => query_error(err),
                })?;
            Ok(())
        })
        .await
    }

    async fn find_entry(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            let row = dispatch_queue::table
                .find((name, id))
                .select(QueueEntryRow::as_select())
                .first::<QueueEntryRow>(connection)
                .optional()
                .map_err(query_error)?;
            row.map(row_to_entry).transpose()
        })
        .await
    }

    async fn try_claim(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let (name, id) = key_columns(key)?;
        let worker_id = worker.as_str().to_owned();
        self.run_blocking(move |connection| {
            // Single conditional update: only a pending row can be claimed.
            let row = diesel::update(
                dispatch_queue::table
                    .find((name, id))
                    .filter(dispatch_queue::state.eq(DispatchState::Pending.as_str())),
            )
            .set((
                dispatch_queue::state.eq(DispatchState::Claimed.as_str()),
                dispatch_queue::worker_id.eq(Some(worker_id)),
                dispatch_queue::lease_expires_at.eq(Some(lease_expires_at)),
                dispatch_queue::attempts.eq(dispatch_queue::attempts + 1),
            ))
            .returning(QueueEntryRow::as_returning())
            .get_result::<QueueEntryRow>(connection)
            .optional()
            .map_err(query_error)?;
            row.map(row_to_entry).transpose()
        })
        .await
    }

    async fn mark_running(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry> {
        let (name, id) = key_columns(key)?;
        let worker_id = worker.as_str().to_owned();
        let row = self
            .run_blocking(move |connection| {
                diesel::update(
                    dispatch_queue::table
                        .find((name, id))
                        .filter(dispatch_queue::worker_id.eq(worker_id))
                        .filter(dispatch_queue::state.ne(DispatchState::Pending.as_str())),
                )
                .set(dispatch_queue::state.eq(DispatchState::Running.as_str()))
                .returning(QueueEntryRow::as_returning())
                .get_result::<QueueEntryRow>(connection)
                .optional()
                .map_err(query_error)
            })
            .await?;
        held_row(row, key, worker)
    }

    async fn heartbeat(
        &self,
        key: &TaskKey,
        worker: &WorkerId,
        lease_expires_at: DateTime<Utc>,
    ) -> StoreResult<QueueEntry> {
        let (name, id) = key_columns(key)?;
        let worker_id = worker.as_str().to_owned();
        let row = self
            .run_blocking(move |connection| {
                diesel::update(
                    dispatch_queue::table
                        .find((name, id))
                        .filter(dispatch_queue::worker_id.eq(worker_id))
                        .filter(dispatch_queue::state.ne(DispatchState::Pending.as_str())),
                )
                .set(dispatch_queue::lease_expires_at.eq(Some(lease_expires_at)))
                .returning(QueueEntryRow::as_returning())
                .get_result::<QueueEntryRow>(connection)
                .optional()
                .map_err(query_error)
            })
            .await?;
        held_row(row, key, worker)
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueueEntry>> {
        self.run_blocking(move |connection| {
            let rows = dispatch_queue::table
                .filter(dispatch_queue::state.ne(DispatchState::Pending.as_str()))
                .filter(dispatch_queue::lease_expires_at.lt(now))
                .order(dispatch_queue::enqueued_at.asc())
                .select(QueueEntryRow::as_select())
                .load::<QueueEntryRow>(connection)
                .map_err(query_error)?;
            rows.into_iter().map(row_to_entry).collect()
        })
        .await
    }

    async fn release_expired(
        &self,
        key: &TaskKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<QueueEntry>> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            let row = diesel::update(
                dispatch_queue::table
                    .find((name, id))
                    .filter(dispatch_queue::state.ne(DispatchState::Pending.as_str()))
                    .filter(dispatch_queue::lease_expires_at.lt(now)),
            )
            .set((
                dispatch_queue::state.eq(DispatchState::Pending.as_str()),
                dispatch_queue::worker_id.eq(None::<String>),
                dispatch_queue::lease_expires_at.eq(None::<DateTime<Utc>>),
            ))
            .returning(QueueEntryRow::as_returning())
            .get_result::<QueueEntryRow>(connection)
            .optional()
            .map_err(query_error)?;
            row.map(row_to_entry).transpose()
        })
        .await
    }

    async fn release(&self, key: &TaskKey, worker: &WorkerId) -> StoreResult<QueueEntry> {
        let (name, id) = key_columns(key)?;
        let worker_id = worker.as_str().to_owned();
        let row = self
            .run_blocking(move |connection| {
                diesel::update(
                    dispatch_queue::table
                        .find((name, id))
                        .filter(dispatch_queue::worker_id.eq(worker_id))
                        .filter(dispatch_queue::state.ne(DispatchState::Pending.as_str())),
                )
                .set((
                    dispatch_queue::state.eq(DispatchState::Pending.as_str()),
                    dispatch_queue::worker_id.eq(None::<String>),
                    dispatch_queue::lease_expires_at.eq(None::<DateTime<Utc>>),
                ))
                .returning(QueueEntryRow::as_returning())
                .get_result::<QueueEntryRow>(connection)
                .optional()
                .map_err(query_error)
            })
            .await?;
        held_row(row, key, worker)
    }

    async fn request_cancel(&self, key: &TaskKey) -> StoreResult<Option<QueueEntry>> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            let row = diesel::update(dispatch_queue::table.find((name, id)))
                .set(dispatch_queue::cancel_requested.eq(true))
                .returning(QueueEntryRow::as_returning())
                .get_result::<QueueEntryRow>(connection)
                .optional()
                .map_err(query_error)?;
            row.map(row_to_entry).transpose()
        })
        .await
    }

    async fn remove_entry(&self, key: &TaskKey) -> StoreResult<()> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            diesel::delete(dispatch_queue::table.find((name, id)))
                .execute(connection)
                .map_err(query_error)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ReviewNotificationStore for PostgresPipelineStore {
    async fn find_notification(&self, key: &TaskKey) -> StoreResult<Option<ReviewNotification>> {
        let (name, id) = key_columns(key)?;
        self.run_blocking(move |connection| {
            let row = review_notifications::table
                .find((name, id))
                .select(ReviewNotificationRow::as_select())
                .first::<ReviewNotificationRow>(connection)
                .optional()
                .map_err(query_error)?;
            row.map(|found| {
                serde_json::from_value::<ReviewNotification>(found.document)
                    .map_err(StoreError::persistence)
            })
            .transpose()
        })
        .await
    }

    async fn save_notification(&self, notification: &ReviewNotification) -> StoreResult<()> {
        let row = to_notification_row(notification)?;
        self.run_blocking(move |connection| {
            diesel::insert_into(review_notifications::table)
                .values(&row)
                .on_conflict((
                    review_notifications::pipeline_name,
                    review_notifications::task_id,
                ))
                .do_update()
                .set((
                    review_notifications::document.eq(excluded(review_notifications::document)),
                    review_notifications::updated_at
                        .eq(excluded(review_notifications::updated_at)),
                ))
                .execute(connection)
                .map_err(query_error)?;
            Ok(())
        })
        .await
    }
}

/// Classifies a diesel failure. Lost connections and serialisation
/// conflicts may succeed on retry; everything else is permanent.
fn query_error(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::SerializationFailure,
            _,
        )
        | DieselError::BrokenTransactionManager => StoreError::unavailable(err),
        _ => StoreError::persistence(err),
    }
}

fn held_row(
    row: Option<QueueEntryRow>,
    key: &TaskKey,
    worker: &WorkerId,
) -> StoreResult<QueueEntry> {
    row.map(row_to_entry).transpose()?.ok_or_else(|| StoreError::ClaimLost {
        key: key.clone(),
        worker: worker.clone(),
    })
}

fn key_columns(key: &TaskKey) -> StoreResult<(String, i64)> {
    Ok((
        key.pipeline_name().as_str().to_owned(),
        u64_to_column(key.task_id().value())?,
    ))
}

fn u64_to_column(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(StoreError::persistence)
}

fn column_to_u64(column: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::persistence(RowConversionError::OutOfRange { column, value }))
}

pub(super) fn to_new_task_row(task: &Task) -> StoreResult<NewTaskRow> {
    let (pipeline_name, task_id) = key_columns(task.key())?;
    Ok(NewTaskRow {
        pipeline_name,
        task_id,
        status: task.status().as_str().to_owned(),
        document: serde_json::to_value(task).map_err(StoreError::persistence)?,
        version: u64_to_column(task.version())?,
        created_at: task.created_at(),
        updated_at: task.updated_at(),
    })
}

pub(super) fn row_to_task(row: TaskRow) -> StoreResult<Task> {
    let TaskRow {
        pipeline_name,
        task_id,
        status,
        document,
        version,
    } = row;

    let task = serde_json::from_value::<Task>(document).map_err(StoreError::persistence)?;
    let (document_name, document_id) = key_columns(task.key())?;
    if document_name != pipeline_name || document_id != task_id || task.status().as_str() != status
    {
        return Err(StoreError::persistence(
            RowConversionError::DocumentMismatch(task.key().clone()),
        ));
    }
    Ok(task.with_version(column_to_u64("version", version)?))
}

pub(super) fn to_notification_row(
    notification: &ReviewNotification,
) -> StoreResult<ReviewNotificationRow> {
    let (pipeline_name, task_id) = key_columns(notification.key())?;
    Ok(ReviewNotificationRow {
        pipeline_name,
        task_id,
        document: serde_json::to_value(notification).map_err(StoreError::persistence)?,
        updated_at: notification.updated_at(),
    })
}

pub(super) fn to_new_entry_row(entry: &QueueEntry) -> StoreResult<NewQueueEntryRow> {
    let (pipeline_name, task_id) = key_columns(entry.key())?;
    Ok(NewQueueEntryRow {
        pipeline_name,
        task_id,
        state: entry.state().as_str().to_owned(),
        worker_id: entry.worker().map(|worker| worker.as_str().to_owned()),
        lease_expires_at: entry.lease_expires_at(),
        cancel_requested: entry.cancel_requested(),
        attempts: i32::try_from(entry.attempts()).map_err(StoreError::persistence)?,
        enqueued_at: entry.enqueued_at(),
    })
}

pub(super) fn row_to_entry(row: QueueEntryRow) -> StoreResult<QueueEntry> {
    let QueueEntryRow {
        pipeline_name,
        task_id,
        state,
        worker_id,
        lease_expires_at,
        cancel_requested,
        attempts,
        enqueued_at,
    } = row;

    let key = TaskKey::from_parts(&pipeline_name, column_to_u64("task_id", task_id)?)
        .map_err(StoreError::persistence)?;
    let dispatch_state = DispatchState::parse(&state)
        .ok_or_else(|| StoreError::persistence(RowConversionError::UnknownDispatchState(state)))?;
    let claim_count = u32::try_from(attempts).map_err(|_| {
        StoreError::persistence(RowConversionError::OutOfRange {
            column: "attempts",
            value: i64::from(attempts),
        })
    })?;

    Ok(QueueEntry::from_persisted(PersistedQueueEntry {
        key,
        state: dispatch_state,
        worker: worker_id.map(WorkerId::new),
        lease_expires_at,
        cancel_requested,
        attempts: claim_count,
        enqueued_at,
    }))
}
