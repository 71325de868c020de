//! Message bus port for dispatch announcements.

use crate::pipeline::domain::DispatchEvent;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe bus with consumer-group delivery.
///
/// Each published event is delivered to exactly one active subscription.
#[async_trait]
pub trait DispatchBus: Send + Sync {
    /// Publishes a dispatch event.
    async fn publish(&self, event: DispatchEvent) -> BusResult<()>;

    /// Joins the consumer group.
    async fn subscribe(&self) -> BusResult<Box<dyn DispatchSubscription>>;
}

/// One member of the dispatch consumer group.
#[async_trait]
pub trait DispatchSubscription: Send {
    /// Waits for the next event. Returns `None` once the bus is closed.
    async fn next(&mut self) -> BusResult<Option<DispatchEvent>>;
}

/// Errors returned by bus implementations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// The bus no longer accepts messages.
    #[error("dispatch bus is closed")]
    Closed,

    /// Transport failure.
    #[error("bus transport error: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl BusError {
    /// Wraps a transport error.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Arc::new(err))
    }
}
