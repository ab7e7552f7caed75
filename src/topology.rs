//! Declarative topology values replayed on every channel session.
//!
//! These are pure values: a [`Consumer`](crate::Consumer) captures them once
//! at construction and re-applies them verbatim each time it has to set a
//! fresh channel up. Nothing here is mutated by runtime events.

use amq_protocol_types::FieldTable;
pub use lapin::ExchangeKind;

/// Configuration options when declaring the queue a consumer pulls from.
#[derive(Clone, Debug)]
pub struct QueueOptions {
    /// Will the queue survive a broker restart?
    pub durable: bool,
    /// The queue is used by only one connection and deleted when that
    /// connection closes.
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Check for existence instead of creating - fails if the queue is
    /// missing or declared with conflicting settings.
    pub passive: bool,
    /// Extra queue arguments, e.g. `x-dead-letter-exchange`.
    pub arguments: FieldTable,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            arguments: FieldTable::default(),
        }
    }
}

/// An exchange to declare before the queue is bound.
#[derive(Clone, Debug)]
pub struct ExchangeOptions {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
    pub arguments: FieldTable,
}

impl ExchangeOptions {
    pub fn new(exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            // The exchange will survive broker restarts.
            durable: true,
            auto_delete: false,
            internal: false,
            passive: false,
            arguments: FieldTable::default(),
        }
    }

    pub fn direct(exchange: impl Into<String>) -> Self {
        Self::new(exchange, ExchangeKind::Direct)
    }

    pub fn fanout(exchange: impl Into<String>) -> Self {
        Self::new(exchange, ExchangeKind::Fanout)
    }

    pub fn topic(exchange: impl Into<String>) -> Self {
        Self::new(exchange, ExchangeKind::Topic)
    }
}

/// A binding from an exchange to the consumer's queue.
///
/// The queue side is implicit: bindings always target the queue resolved for
/// the current session, which matters when the broker picks the name.
#[derive(Clone, Debug)]
pub struct QueueBinding {
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl QueueBinding {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: FieldTable::default(),
        }
    }
}

/// An exchange-to-exchange binding.
#[derive(Clone, Debug)]
pub struct ExchangeBinding {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl ExchangeBinding {
    pub fn new(
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
            arguments: FieldTable::default(),
        }
    }
}

/// Channel-level quality of service.
///
/// `prefetch_count` bounds how many unacknowledged messages the broker will
/// push at once; it is the upper bound on the consumer's prefetch buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QosOptions {
    pub prefetch_count: u16,
    /// Apply the limit to the whole channel rather than per consumer.
    pub global: bool,
}

impl QosOptions {
    pub fn prefetch(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            global: false,
        }
    }
}

/// Options passed on `basic.consume`, derived from the consumer's
/// configuration rather than set directly.
#[derive(Clone, Debug, Default)]
pub struct ConsumeOptions {
    /// The broker considers every delivered message settled immediately and
    /// expects no ack/nack.
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}
