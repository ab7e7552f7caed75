//! The `Handler` trait and its closure adapter.
use std::future::Future;

use crate::consumer::outcome::ConsumerStatus;
use crate::consumer::reply::Replier;
use crate::message::Message;

/// A dequeued message, ready for processing.
///
/// `Incoming` is the input type of message handlers. It owns the message:
/// each delivery is handed to exactly one handler invocation.
pub struct Incoming {
    pub message: Message,
    /// Publishes responses to the message's `reply-to` address over the
    /// consumer's current channel.
    pub replier: Replier,
    /// The resolved name of the queue the message came from.
    pub queue_name: String,
}

/// Implementers of the `Handler` trait process messages retrieved from a
/// queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying channel. The consumer
/// takes care of acking/nacking the message with the broker according to the
/// returned [`ConsumerStatus`]:
///
/// - `Ok(None)` or `Ok(Some(ConsumerStatus::Ack))` acks the message;
/// - `Ok(Some(ConsumerStatus::Requeue))` nacks it back onto the queue;
/// - `Ok(Some(ConsumerStatus::Drop))` nacks it without requeue;
/// - `Err(_)` requeues or drops depending on the consumer's
///   requeue-on-error setting, and emits an error event.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time
/// you will rely on the blanket support for async closures with a matching
/// signature via [`ConsumerBuilder::handler`](crate::ConsumerBuilder::handler).
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming) -> Result<Option<ConsumerStatus>, anyhow::Error>;
}

/// Implement the [`Handler`] trait for all Boxed handlers.
#[async_trait::async_trait]
impl<H> Handler for Box<H>
where
    H: Handler + ?Sized,
{
    async fn handle(&self, incoming: Incoming) -> Result<Option<ConsumerStatus>, anyhow::Error> {
        H::handle(self, incoming).await
    }
}

/// Wrapper type turning a matching async closure into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

/// Handlers do not have to return `anyhow::Error` directly - any error type
/// convertible into it will do.
#[async_trait::async_trait]
impl<F, Fut, Err> Handler for ClosureHandler<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<ConsumerStatus>, Err>> + Send + 'static,
    Err: Into<anyhow::Error> + Send + 'static,
{
    async fn handle(&self, incoming: Incoming) -> Result<Option<ConsumerStatus>, anyhow::Error> {
        (self.0)(incoming).await.map_err(Into::into)
    }
}
