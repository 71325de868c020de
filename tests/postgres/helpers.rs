//! Shared helpers for `PostgreSQL` adapter integration tests.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use mockable::DefaultClock;
use pg_embedded_setup_unpriv::TestCluster;
use pipewright::pipeline::{
    adapters::postgres::PostgresPipelineStore,
    domain::{BuildPayload, PipelineType, Subtask, SubtaskPayload, Task, TaskDraft, TaskKey},
};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Boxed error used by the setup helpers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// SQL creating the pipeline tables.
pub const CREATE_PIPELINE_TABLES_SQL: &str =
    include_str!("../../migrations/2026-01-01-000000_create_pipeline_tables/up.sql");

/// Template database name for the pre-migrated schema.
const TEMPLATE_DB: &str = "pipewright_test_template";

/// Creates a multi-threaded runtime so claims can race on separate threads.
pub fn test_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to create test runtime")
}

/// Ensures the template database exists with the schema applied.
fn ensure_template(cluster: &TestCluster) -> Result<(), BoxError> {
    cluster
        .ensure_template_exists(TEMPLATE_DB, |db_name| {
            let url = cluster.connection().database_url(db_name);
            let mut conn = PgConnection::establish(&url).map_err(|e| eyre::eyre!("{e}"))?;
            conn.batch_execute(CREATE_PIPELINE_TABLES_SQL)
                .map_err(|e| eyre::eyre!("schema setup failed: {e}"))?;
            Ok(())
        })
        .map_err(|e| Box::new(e) as BoxError)?;
    Ok(())
}

/// Creates a fresh database from the template and returns a store over a
/// pool of `pool_size` connections.
pub fn setup_store(
    cluster: &TestCluster,
    db_name: &str,
    pool_size: u32,
) -> Result<PostgresPipelineStore, BoxError> {
    ensure_template(cluster)?;
    cluster
        .create_database_from_template(db_name, TEMPLATE_DB)
        .map_err(|e| Box::new(e) as BoxError)?;
    let url = cluster.connection().database_url(db_name);
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .max_size(pool_size)
        .build(manager)
        .map_err(|e| Box::new(e) as BoxError)?;
    Ok(PostgresPipelineStore::new(pool))
}

/// Returns a unique database name for one test.
pub fn database_name(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Drops the test database once the test finishes, even on panic.
///
/// Declare it before the store so the pool closes first.
pub struct CleanupGuard<'a> {
    cluster: &'a TestCluster,
    db_name: String,
}

impl<'a> CleanupGuard<'a> {
    pub const fn new(cluster: &'a TestCluster, db_name: String) -> Self {
        Self { cluster, db_name }
    }
}

impl Drop for CleanupGuard<'_> {
    #[expect(
        clippy::print_stderr,
        reason = "Test cleanup warnings are informational"
    )]
    fn drop(&mut self) {
        if let Err(e) = self.cluster.drop_database(self.db_name.as_str()) {
            eprintln!("Warning: failed to drop test database {}: {e}", self.db_name);
        }
    }
}

/// Returns the key of task `task_id` in the `checkout` pipeline.
pub fn key(task_id: u64) -> TaskKey {
    TaskKey::from_parts("checkout", task_id).expect("valid task key")
}

/// Single-build task ready for insertion.
pub fn build_task(task_id: u64) -> Task {
    TaskDraft::new(key(task_id), PipelineType::Single)
        .with_subtask(Subtask::new(
            SubtaskPayload::Build(BuildPayload {
                service_name: "api".to_owned(),
                build_os: "focal".to_owned(),
                script: "make".to_owned(),
                ..BuildPayload::default()
            }),
            Duration::from_secs(600),
        ))
        .into_task(&DefaultClock)
        .expect("valid draft")
}
