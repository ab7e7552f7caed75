//! Error taxonomy for the consumer.

use std::sync::Arc;

use crate::transport::ChannelError;

/// Failures surfaced through [`ConsumerEvent::Error`] and by `close()`.
///
/// Sources are `Arc`-wrapped so the error can ride the broadcast event bus.
///
/// [`ConsumerEvent::Error`]: crate::ConsumerEvent::Error
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConsumerError {
    /// A setup replay step failed. The consumer retries after the
    /// connection's retry delay.
    #[error("channel session setup failed: {0}")]
    Setup(Arc<ChannelError>),
    /// The channel died mid-session. The consumer replays its setup on a
    /// fresh channel.
    #[error("the channel to the broker was lost: {0}")]
    ChannelLost(Arc<ChannelError>),
    /// A message handler returned an error or panicked. The message was
    /// nacked according to the requeue-on-error setting.
    #[error("a message handler failed: {0}")]
    Handler(Arc<anyhow::Error>),
    /// The broker cancelled the consumer, e.g. because the queue was
    /// deleted. Treated like a channel loss.
    #[error("the broker cancelled the consumer")]
    Cancelled,
    /// The connection shut down for good; the consumer is terminally
    /// closed.
    #[error("the connection shut down and cannot provide further channels: {0}")]
    ConnectionShutdown(Arc<ChannelError>),
}

/// Failures returned by [`Replier`](crate::Replier) calls.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    /// There is no live channel: the consumer is closed or mid-reset.
    #[error("no live channel to publish the reply on")]
    ChannelUnavailable,
    /// The incoming message carries no `reply-to` address and the envelope
    /// did not provide a routing key.
    #[error("the incoming message carries no reply-to address")]
    NoReplyAddress,
    #[error("failed to publish the reply")]
    Publish(#[source] ChannelError),
}
