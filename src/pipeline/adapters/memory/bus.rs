//! In-memory dispatch bus with consumer-group delivery.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::pipeline::{
    domain::DispatchEvent,
    ports::{BusError, BusResult, DispatchBus, DispatchSubscription},
};

/// Dispatch bus where every subscription competes for one shared queue.
///
/// Each event is received by exactly one subscription.
#[derive(Debug, Clone)]
pub struct InMemoryDispatchBus {
    sender: mpsc::UnboundedSender<DispatchEvent>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DispatchEvent>>>,
    published: Arc<AtomicUsize>,
    closed: CancellationToken,
}

impl Default for InMemoryDispatchBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDispatchBus {
    /// Creates an open bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            published: Arc::new(AtomicUsize::new(0)),
            closed: CancellationToken::new(),
        }
    }

    /// Returns how many events have been published.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    /// Stops accepting events; subscribers drain what is queued, then end.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl DispatchBus for InMemoryDispatchBus {
    async fn publish(&self, event: DispatchEvent) -> BusResult<()> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.sender.send(event).map_err(|_| BusError::Closed)?;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> BusResult<Box<dyn DispatchSubscription>> {
        Ok(Box::new(InMemorySubscription {
            receiver: Arc::clone(&self.receiver),
            closed: self.closed.clone(),
        }))
    }
}

struct InMemorySubscription {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DispatchEvent>>>,
    closed: CancellationToken,
}

#[async_trait]
impl DispatchSubscription for InMemorySubscription {
    async fn next(&mut self) -> BusResult<Option<DispatchEvent>> {
        let mut receiver = self.receiver.lock().await;
        if self.closed.is_cancelled() {
            return Ok(receiver.try_recv().ok());
        }
        tokio::select! {
            () = self.closed.cancelled() => Ok(receiver.try_recv().ok()),
            event = receiver.recv() => Ok(event),
        }
    }
}
