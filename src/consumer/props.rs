//! The immutable configuration captured when a consumer is built.

use amq_protocol_types::{AMQPValue, FieldTable};

use crate::topology::{
    ConsumeOptions, ExchangeBinding, ExchangeOptions, QosOptions, QueueBinding, QueueOptions,
};

/// Everything a consumer needs to (re)establish its subscription.
///
/// Captured once at construction and replayed byte-for-byte identical on
/// every session; runtime events never mutate it. The one runtime-tunable
/// knob, concurrency, lives outside this struct for that reason.
#[derive(Clone, Debug)]
pub(crate) struct ConsumerProps {
    /// The queue to consume from. Empty means the broker assigns a fresh
    /// name on every session.
    pub(crate) queue: String,
    /// Upper bound on concurrently running handlers. `None` is unbounded -
    /// the broker's prefetch count becomes the only limit.
    pub(crate) concurrency: Option<usize>,
    /// Requeue messages whose handler failed. When `false` they are dropped
    /// (dead-lettered if the queue is configured for it).
    pub(crate) requeue_on_error: bool,
    /// Consume without broker-side acknowledgements.
    pub(crate) no_ack: bool,
    pub(crate) queue_options: QueueOptions,
    pub(crate) qos: Option<QosOptions>,
    pub(crate) exchanges: Vec<ExchangeOptions>,
    pub(crate) queue_bindings: Vec<QueueBinding>,
    pub(crate) exchange_bindings: Vec<ExchangeBinding>,
    /// Consumer priority. See <https://www.rabbitmq.com/consumer-priority.html>.
    pub(crate) priority: Option<i32>,
    pub(crate) consume_arguments: FieldTable,
}

impl ConsumerProps {
    pub(crate) fn new(queue: String) -> Self {
        Self {
            queue,
            concurrency: None,
            requeue_on_error: true,
            no_ack: false,
            queue_options: QueueOptions::default(),
            qos: None,
            exchanges: Vec::new(),
            queue_bindings: Vec::new(),
            exchange_bindings: Vec::new(),
            priority: None,
            consume_arguments: FieldTable::default(),
        }
    }

    /// Derive the `basic.consume` options for a session.
    pub(crate) fn consume_options(&self) -> ConsumeOptions {
        let mut arguments = self.consume_arguments.clone();
        if let Some(priority) = self.priority {
            arguments.insert("x-priority".into(), AMQPValue::LongInt(priority));
        }
        ConsumeOptions {
            no_ack: self.no_ack,
            exclusive: false,
            arguments,
        }
    }
}
