//! Lifecycle events broadcast to the surrounding application.

use tokio::sync::broadcast;

use crate::consumer::error::ConsumerError;

/// Events emitted by a consumer's lifecycle state machine.
#[derive(Clone, Debug)]
pub enum ConsumerEvent {
    /// A new channel session is live and consuming. Fired after every
    /// successful setup replay, including the first one.
    Ready,
    /// A setup step, a message handler or the broker failed. The consumer
    /// keeps running; only `close()` or a connection shutdown stops it.
    Error(ConsumerError),
}

/// Broadcast channel for consumer events.
///
/// Thin wrapper over [`tokio::sync::broadcast`]; the lifecycle state machine
/// is the sole producer, the application subscribes via
/// [`Consumer::events`](crate::Consumer::events).
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ConsumerEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    /// Errors are ignored if there are no active subscribers.
    pub(crate) fn publish(&self, event: ConsumerEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.tx.subscribe()
    }
}
