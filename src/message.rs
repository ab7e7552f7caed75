//! Inbound and outbound message types.

use amq_protocol_types::{FieldTable, ShortString};

/// The set of AMQP properties associated with a message. Re-exported from
/// `lapin` so users do not need a direct `lapin` dependency to inspect or
/// build them.
pub use lapin::protocol::basic::AMQPProperties;

/// A message delivered by the broker.
///
/// Owned by the consumer's prefetch buffer until dispatched; ownership then
/// transfers to exactly one handler invocation.
#[derive(Debug)]
pub struct Message {
    /// Broker-assigned identifier used in ack/nack calls.
    /// Only valid on the channel that delivered the message.
    pub delivery_tag: u64,
    /// The exchange the message was published to.
    pub exchange: String,
    pub routing_key: String,
    /// `true` if the broker delivered this message before, e.g. after a
    /// requeue.
    pub redelivered: bool,
    pub properties: AMQPProperties,
    pub payload: Vec<u8>,
}

impl Message {
    /// The queue (or routing key) replies should be published to.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to().as_ref().map(ShortString::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(ShortString::as_str)
    }
}

impl From<lapin::message::Delivery> for Message {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            payload: delivery.data,
        }
    }
}

/// A message to be published, e.g. as a reply to an incoming message.
#[derive(Debug, Default)]
pub struct OutboundMessage {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The name of the exchange to publish to. Empty string is the default
    /// exchange, which routes directly to the queue named by `routing_key`.
    pub exchange: String,
    pub routing_key: String,
    /// AMQP properties attached to the message.
    /// It can be omitted by passing `None`.
    pub properties: Option<AMQPProperties>,
}

impl OutboundMessage {
    pub fn with_payload(mut self, value: Vec<u8>) -> Self {
        self.payload = value;
        self
    }

    pub fn with_exchange(mut self, value: impl Into<String>) -> Self {
        self.exchange = value.into();
        self
    }

    pub fn with_routing_key(mut self, value: impl Into<String>) -> Self {
        self.routing_key = value.into();
        self
    }

    fn props(mut self, f: impl FnOnce(AMQPProperties) -> AMQPProperties) -> Self {
        self.properties = Some(f(self.properties.unwrap_or_default()));
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }
}
