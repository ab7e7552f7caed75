//! A self-healing AMQP 0-9-1 consumer for RabbitMQ.
//!
//! `warren` keeps a queue subscription alive for you. You describe the
//! subscription once - queue, exchanges, bindings, QoS - and the consumer
//! replays that setup on a fresh channel whenever the current one dies.
//! Messages flow through an async handler under a bounded concurrency
//! budget, and every delivery is acked or nacked exactly once based on the
//! handler's outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warren::{
//!     ConnectionFactory, Consumer, ConsumerStatus, QosOptions, QueueBinding, RabbitConnection,
//!     RabbitMqSettings,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anyhow::Error> {
//!     let settings = RabbitMqSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!     let connection = Arc::new(RabbitConnection::new(factory));
//!
//!     let mut consumer = Consumer::builder(connection, "orders")
//!         .queue_binding(QueueBinding::new("events", "order.*"))
//!         .qos(QosOptions::prefetch(16))
//!         .concurrency(8)
//!         .handler(|incoming| async move {
//!             println!("received {} bytes", incoming.message.payload.len());
//!             incoming.replier.reply(b"done".to_vec()).await?;
//!             Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
//!         });
//!
//!     // ... run until shutdown ...
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```

pub mod configuration;
pub mod consumer;
pub mod message;
pub mod rabbit_mq;
pub mod topology;
pub mod transport;

pub use configuration::{RabbitMqSettings, RabbitMqTlsSettings};
pub use consumer::{
    ClosureHandler, Consumer, ConsumerBuilder, ConsumerError, ConsumerEvent, ConsumerStatus,
    Handler, Incoming, Replier, ReplyError, Stats,
};
pub use message::{AMQPProperties, Message, OutboundMessage};
pub use rabbit_mq::{ConnectionFactory, RabbitConnection};
pub use topology::{
    ConsumeOptions, ExchangeBinding, ExchangeKind, ExchangeOptions, QosOptions, QueueBinding,
    QueueOptions,
};
pub use transport::{ChannelError, ChannelSource, ConsumerChannel, DynChannel};
