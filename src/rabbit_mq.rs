//! The lapin-backed implementation of the transport traits.
//!
//! [`ConnectionFactory`] knows how to establish a (possibly TLS) connection
//! to a RabbitMq broker; [`RabbitConnection`] wraps it into a lazily
//! reconnecting [`ChannelSource`]; [`RabbitChannel`] adapts a `lapin`
//! channel to [`ConsumerChannel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeBindOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::ConnectionProperties;
use tokio::sync::mpsc;
use tracing::warn;

use crate::configuration::RabbitMqSettings;
use crate::message::OutboundMessage;
use crate::topology::{
    ConsumeOptions, ExchangeBinding, ExchangeOptions, QosOptions, QueueBinding, QueueOptions,
};
use crate::transport::{
    ChannelError, ChannelEvent, ChannelSource, ConsumeStart, ConsumerChannel, DynChannel,
    QueueInfo,
};

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// The pause between consumer setup attempts when the broker is
    /// unreachable or a channel keeps failing.
    retry_delay: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Connection timeout defaults to 10 seconds and the setup retry delay
    /// to 3 seconds when left unspecified.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let server_domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);
                let mut builder = NativeTlsConnector::builder();
                if let Some(root_certificate) = tls_settings
                    .ca_certificate_chain()
                    .context("Failed to parse CA certificate for RabbitMq TLS.")?
                {
                    builder.add_root_certificate(root_certificate);
                }
                let connector = builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq.")?;
                Ok(Tls {
                    domain_name: server_domain_name,
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        let retry_delay = settings
            .retry_delay()
            .unwrap_or_else(|| Duration::from_secs(3));
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            retry_delay,
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = match &self.tls {
            None => self.connect_without_tls(properties).await,
            Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
        }?;
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, anyhow::Error> {
        match tokio::time::timeout(
            self.connection_timeout,
            lapin::Connection::connect_uri(self.uri.clone(), properties),
        )
        .await
        {
            Ok(result) => result.with_context(|| "Failed to connect to RabbitMQ."),
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to connect to RabbitMQ."
            )),
        }
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, anyhow::Error> {
        match tokio::time::timeout(
            self.connection_timeout,
            lapin::Connection::connector(
                self.uri.clone(),
                Box::new(move |uri| {
                    // First establish a plain TCP connection using the AMQP protocol
                    let mut amqp_uri = uri.clone();
                    amqp_uri.scheme = AMQPScheme::AMQP;
                    amqp_uri
                        .connect()
                        // Then perform a TLS handshake with custom settings
                        // including the expected domain for the server certificate
                        .and_then(|tcp| {
                            tcp.into_native_tls(
                                &tls_configuration.connector,
                                &tls_configuration.domain_name,
                            )
                        })
                }),
                properties,
            ),
        )
        .await
        {
            Ok(result) => {
                result.with_context(|| "Failed to establish a TLS connection to RabbitMQ.")
            }
            Err(_) => Err(anyhow::anyhow!(
                "Timed out while trying to establish a TLS connection to RabbitMQ."
            )),
        }
    }
}

/// A lazily reconnecting [`ChannelSource`] over a single lapin connection.
///
/// `acquire` reuses the live connection when it is still healthy and
/// re-establishes it otherwise. After [`RabbitConnection::shutdown`] every
/// acquire fails with [`ChannelError::ConnectionClosed`], which consumers
/// treat as terminal.
pub struct RabbitConnection {
    factory: ConnectionFactory,
    connection: tokio::sync::Mutex<Option<lapin::Connection>>,
    shut_down: AtomicBool,
}

impl RabbitConnection {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            connection: tokio::sync::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Permanently shut the connection down.
    ///
    /// In-flight channels die with the connection; further `acquire` calls
    /// fail with [`ChannelError::ConnectionClosed`].
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            if let Err(error) = connection.close(200, "client shut down").await {
                warn!(?error, "error while closing the RabbitMQ connection");
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelSource for RabbitConnection {
    #[tracing::instrument(name = "rabbitmq_acquire_channel", skip(self))]
    async fn acquire(&self) -> Result<DynChannel, ChannelError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }
        let mut guard = self.connection.lock().await;
        let connection = match guard.take() {
            Some(live) if live.status().connected() => guard.insert(live),
            _ => {
                let fresh = self
                    .factory
                    .new_connection()
                    .await
                    .map_err(ChannelError::Protocol)?;
                guard.insert(fresh)
            }
        };
        let channel = connection.create_channel().await.map_err(ChannelError::from)?;
        Ok(Arc::new(RabbitChannel { channel }))
    }

    fn retry_delay(&self) -> Duration {
        self.factory.retry_delay
    }
}

/// A single AMQP channel, adapted to the [`ConsumerChannel`] interface.
pub struct RabbitChannel {
    channel: lapin::Channel,
}

#[async_trait::async_trait]
impl ConsumerChannel for RabbitChannel {
    async fn exchange_declare(&self, options: &ExchangeOptions) -> Result<(), ChannelError> {
        self.channel
            .exchange_declare(
                &options.exchange,
                options.kind.clone(),
                ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                options.arguments.clone(),
            )
            .await
            .map_err(Into::into)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, ChannelError> {
        let queue = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                options.arguments.clone(),
            )
            .await?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, binding: &QueueBinding) -> Result<(), ChannelError> {
        self.channel
            .queue_bind(
                queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                binding.arguments.clone(),
            )
            .await
            .map_err(Into::into)
    }

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), ChannelError> {
        self.channel
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions { nowait: false },
                binding.arguments.clone(),
            )
            .await
            .map_err(Into::into)
    }

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), ChannelError> {
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(Into::into)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumeStart, ChannelError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                options.arguments.clone(),
            )
            .await?;
        let consumer_tag = consumer.tag().as_str().to_owned();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_deliveries(consumer, events_tx, self.channel.clone()));
        Ok(ConsumeStart {
            consumer_tag,
            events: events_rx,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(Into::into)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(Into::into)
    }

    async fn basic_publish(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        let properties = message.properties.unwrap_or_default();
        // Persistent delivery unless the caller picked a mode explicitly.
        let properties = if properties.delivery_mode().is_none() {
            properties.with_delivery_mode(2)
        } else {
            properties
        };
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    // The immediate flag was dropped in RabbitMQ 3.0; setting
                    // it causes a not-supported error.
                    immediate: false,
                },
                &message.payload,
                properties,
            )
            .await?;
        confirm.await.map(|_| ()).map_err(Into::into)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), ChannelError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(Into::into)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.channel.close(200, "consumer closed").await.map_err(Into::into)
    }
}

/// Forward the lapin delivery stream into the consumer's event channel.
async fn pump_deliveries(
    mut consumer: lapin::Consumer,
    events: mpsc::UnboundedSender<ChannelEvent>,
    channel: lapin::Channel,
) {
    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => {
                if events.send(ChannelEvent::Delivery(delivery.into())).is_err() {
                    // The consumer moved on to a new session.
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(ChannelEvent::Closed(error.into()));
                return;
            }
        }
    }
    // The stream ended without an error: either we cancelled the consumer
    // ourselves or the broker did.
    let event = if channel.status().connected() {
        ChannelEvent::Cancelled
    } else {
        ChannelEvent::Closed(ChannelError::ChannelClosed)
    };
    let _ = events.send(event);
}
