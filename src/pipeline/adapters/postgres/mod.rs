//! `PostgreSQL` adapters for pipeline persistence.
//!
//! Task documents are stored as JSONB next to a version column used for
//! optimistic concurrency. Queue claims are single conditional `UPDATE`
//! statements. The schema lives under `migrations/`.

mod models;
mod repository;
mod schema;

pub use repository::{PipelinePgPool, PostgresPipelineStore, RowConversionError};
