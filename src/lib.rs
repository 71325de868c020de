//! Pipewright: CI/CD pipeline orchestration engine.
//!
//! This crate accepts pipeline tasks made of ordered build, test, and deploy
//! subtasks, dispatches them through a durable queue to a pool of workers,
//! runs each subtask as a containerised workload, streams workload output,
//! and reports progress back to code-review systems.
//!
//! # Architecture
//!
//! Pipewright follows hexagonal architecture principles:
//!
//! - **Domain**: Pure business logic with no infrastructure dependencies
//! - **Ports**: Abstract trait interfaces for external interactions
//! - **Adapters**: Concrete implementations of ports (database, clusters, etc.)
//!
//! # Modules
//!
//! - [`pipeline`]: Task model, dispatch, execution, logs, and review feedback
//! - [`config`]: Engine configuration
//! - [`telemetry`]: Tracing subscriber setup

pub mod config;
pub mod pipeline;
pub mod telemetry;
