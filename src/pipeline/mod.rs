//! CI/CD pipeline execution.
//!
//! A submitted task is validated and stored, queued durably, claimed by
//! exactly one worker, and executed subtask by subtask as workloads on a
//! cluster. Status changes are mirrored back to the originating review. The
//! module follows hexagonal architecture:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - Adapter implementations in [`adapters`]
//! - Orchestration services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
