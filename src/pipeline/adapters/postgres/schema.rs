//! Diesel schema for pipeline persistence.

diesel::table! {
    /// Task documents with an optimistic-concurrency version.
    pipeline_tasks (pipeline_name, task_id) {
        /// Pipeline name.
        #[max_length = 255]
        pipeline_name -> Varchar,
        /// Task number within the pipeline.
        task_id -> Int8,
        /// Denormalised task status for filtering.
        #[max_length = 32]
        status -> Varchar,
        /// Full task document.
        document -> Jsonb,
        /// Optimistic-concurrency version.
        version -> Int8,
        /// Creation timestamp.
        created_at -> Timestamptz,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    /// Dispatch queue entries, one per non-terminal task.
    dispatch_queue (pipeline_name, task_id) {
        /// Pipeline name.
        #[max_length = 255]
        pipeline_name -> Varchar,
        /// Task number within the pipeline.
        task_id -> Int8,
        /// Dispatch state.
        #[max_length = 16]
        state -> Varchar,
        /// Claiming worker.
        #[max_length = 255]
        worker_id -> Nullable<Varchar>,
        /// End of the current claim lease.
        lease_expires_at -> Nullable<Timestamptz>,
        /// Cancellation flag.
        cancel_requested -> Bool,
        /// Number of claims so far.
        attempts -> Int4,
        /// Enqueue timestamp.
        enqueued_at -> Timestamptz,
    }
}

diesel::table! {
    /// Last allocated task number per pipeline.
    pipeline_counters (pipeline_name) {
        /// Pipeline name.
        #[max_length = 255]
        pipeline_name -> Varchar,
        /// Last allocated task number.
        last_task_id -> Int8,
    }
}

diesel::table! {
    /// Review notification records.
    review_notifications (pipeline_name, task_id) {
        /// Pipeline name.
        #[max_length = 255]
        pipeline_name -> Varchar,
        /// Task number within the pipeline.
        task_id -> Int8,
        /// Notification document.
        document -> Jsonb,
        /// Last update timestamp.
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(pipeline_tasks, dispatch_queue);
