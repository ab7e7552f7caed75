//! The seam between the consumer and the AMQP wire.
//!
//! [`ChannelSource`] and [`ConsumerChannel`] are the only two interfaces the
//! consumer relies on to talk to a broker. The production implementation
//! lives in [`rabbit_mq`](crate::rabbit_mq); tests plug in an in-memory
//! double, which is the whole point of keeping this boundary a trait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::message::{Message, OutboundMessage};
use crate::topology::{
    ConsumeOptions, ExchangeBinding, ExchangeOptions, QosOptions, QueueBinding, QueueOptions,
};

pub type DynChannel = Arc<dyn ConsumerChannel>;

/// Errors surfaced by channel or connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("AMQP operation failed: {0}")]
    Protocol(#[source] anyhow::Error),
    #[error("the channel to the broker is closed")]
    ChannelClosed,
    #[error("the connection is shut down and will not hand out further channels")]
    ConnectionClosed,
}

impl From<lapin::Error> for ChannelError {
    fn from(error: lapin::Error) -> Self {
        match error {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                ChannelError::ChannelClosed
            }
            other => ChannelError::Protocol(other.into()),
        }
    }
}

/// Events a live channel pushes to the consumer that started it.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The broker delivered a message.
    Delivery(Message),
    /// The broker cancelled the consumer, e.g. because the queue was deleted.
    Cancelled,
    /// The channel died.
    Closed(ChannelError),
}

/// The broker's answer to a queue declaration.
#[derive(Clone, Debug)]
pub struct QueueInfo {
    /// The resolved queue name - broker-generated when declared with an
    /// empty name.
    pub name: String,
    /// How many messages were sitting in the queue at declaration time.
    pub message_count: u32,
}

/// A started `basic.consume`: the resolved tag plus the inbound event stream.
pub struct ConsumeStart {
    pub consumer_tag: String,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// One channel to the broker, the exclusive sink for all wire operations of
/// a single consumer session.
#[async_trait::async_trait]
pub trait ConsumerChannel: Send + Sync + 'static {
    async fn exchange_declare(&self, options: &ExchangeOptions) -> Result<(), ChannelError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, ChannelError>;

    async fn queue_bind(&self, queue: &str, binding: &QueueBinding) -> Result<(), ChannelError>;

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), ChannelError>;

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), ChannelError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumeStart, ChannelError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), ChannelError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;

    async fn basic_publish(&self, message: OutboundMessage) -> Result<(), ChannelError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Hands out channels and owns the reconnect policy.
///
/// `acquire` may block while the underlying connection re-establishes
/// itself; `retry_delay` paces the consumer's own setup retries so a failing
/// broker is not hammered in a busy loop.
#[async_trait::async_trait]
pub trait ChannelSource: Send + Sync + 'static {
    async fn acquire(&self) -> Result<DynChannel, ChannelError>;

    fn retry_delay(&self) -> Duration;
}
