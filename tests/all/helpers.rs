//! An in-memory broker double implementing the transport traits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use warren::message::{AMQPProperties, Message, OutboundMessage};
use warren::topology::{
    ConsumeOptions, ExchangeBinding, ExchangeOptions, QosOptions, QueueBinding, QueueOptions,
};
use warren::transport::{
    ChannelError, ChannelEvent, ChannelSource, ConsumeStart, ConsumerChannel, DynChannel,
    QueueInfo,
};
use warren::Consumer;

/// Every wire operation a [`MockChannel`] saw, in call order.
#[derive(Clone, Debug, PartialEq)]
pub enum WireCall {
    ExchangeDeclare {
        exchange: String,
    },
    QueueDeclare {
        queue: String,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    ExchangeBind {
        destination: String,
        source: String,
        routing_key: String,
    },
    Qos {
        prefetch_count: u16,
    },
    Consume {
        queue: String,
        no_ack: bool,
    },
    Ack(u64),
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        correlation_id: Option<String>,
        payload: Vec<u8>,
    },
    Cancel,
    Close,
}

/// A scripted channel: records every wire call and lets the test push
/// deliveries, broker cancellations and channel deaths.
pub struct MockChannel {
    calls: Mutex<Vec<WireCall>>,
    /// Name handed back when a queue is declared with an empty name.
    generated_queue_name: String,
    message_count: u32,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Self::with_queue("mock-queue", 0)
    }

    pub fn with_queue(generated_queue_name: &str, message_count: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            generated_queue_name: generated_queue_name.to_owned(),
            message_count,
            events: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> Vec<WireCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: WireCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn sender(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .expect("basic_consume was not called on this channel")
    }

    /// Push a delivery to the consumer, as the broker would.
    pub fn deliver(&self, message: Message) {
        self.sender()
            .send(ChannelEvent::Delivery(message))
            .expect("the consumer dropped this channel's event stream");
    }

    /// Kill the channel from the broker side.
    pub fn kill(&self) {
        let _ = self
            .sender()
            .send(ChannelEvent::Closed(ChannelError::ChannelClosed));
    }

    /// Cancel the consumer from the broker side, e.g. queue deletion.
    pub fn cancel_from_broker(&self) {
        let _ = self.sender().send(ChannelEvent::Cancelled);
    }
}

#[async_trait::async_trait]
impl ConsumerChannel for MockChannel {
    async fn exchange_declare(&self, options: &ExchangeOptions) -> Result<(), ChannelError> {
        self.record(WireCall::ExchangeDeclare {
            exchange: options.exchange.clone(),
        });
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _options: &QueueOptions,
    ) -> Result<QueueInfo, ChannelError> {
        self.record(WireCall::QueueDeclare {
            queue: queue.to_owned(),
        });
        let name = if queue.is_empty() {
            self.generated_queue_name.clone()
        } else {
            queue.to_owned()
        };
        Ok(QueueInfo {
            name,
            message_count: self.message_count,
        })
    }

    async fn queue_bind(&self, queue: &str, binding: &QueueBinding) -> Result<(), ChannelError> {
        self.record(WireCall::QueueBind {
            queue: queue.to_owned(),
            exchange: binding.exchange.clone(),
            routing_key: binding.routing_key.clone(),
        });
        Ok(())
    }

    async fn exchange_bind(&self, binding: &ExchangeBinding) -> Result<(), ChannelError> {
        self.record(WireCall::ExchangeBind {
            destination: binding.destination.clone(),
            source: binding.source.clone(),
            routing_key: binding.routing_key.clone(),
        });
        Ok(())
    }

    async fn basic_qos(&self, qos: &QosOptions) -> Result<(), ChannelError> {
        self.record(WireCall::Qos {
            prefetch_count: qos.prefetch_count,
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> Result<ConsumeStart, ChannelError> {
        self.record(WireCall::Consume {
            queue: queue.to_owned(),
            no_ack: options.no_ack,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(events_tx);
        Ok(ConsumeStart {
            consumer_tag: consumer_tag.to_owned(),
            events: events_rx,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.record(WireCall::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.record(WireCall::Nack {
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn basic_publish(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        let correlation_id = message
            .properties
            .as_ref()
            .and_then(|p| p.correlation_id().as_ref())
            .map(|id| id.as_str().to_owned());
        self.record(WireCall::Publish {
            exchange: message.exchange,
            routing_key: message.routing_key,
            correlation_id,
            payload: message.payload,
        });
        Ok(())
    }

    async fn basic_cancel(&self, _consumer_tag: &str) -> Result<(), ChannelError> {
        self.record(WireCall::Cancel);
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.record(WireCall::Close);
        Ok(())
    }
}

/// A scripted channel source: hands out the queued channels in order and
/// fails acquisition once they run out, until the test pushes more.
pub struct MockConnection {
    channels: Mutex<VecDeque<Arc<MockChannel>>>,
    acquires: AtomicUsize,
    shut_down: AtomicBool,
}

impl MockConnection {
    pub fn new(channels: Vec<Arc<MockChannel>>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(channels.into()),
            acquires: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn push_channel(&self, channel: Arc<MockChannel>) {
        self.channels.lock().unwrap().push_back(channel);
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ChannelSource for MockConnection {
    async fn acquire(&self) -> Result<DynChannel, ChannelError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }
        match self.channels.lock().unwrap().pop_front() {
            Some(channel) => Ok(channel),
            None => Err(ChannelError::Protocol(anyhow::anyhow!(
                "no broker channel available"
            ))),
        }
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(10)
    }
}

pub fn message(delivery_tag: u64) -> Message {
    message_with(delivery_tag, "mock-queue", AMQPProperties::default())
}

pub fn message_with(delivery_tag: u64, routing_key: &str, properties: AMQPProperties) -> Message {
    Message {
        delivery_tag,
        exchange: String::new(),
        routing_key: routing_key.to_owned(),
        redelivered: false,
        properties,
        payload: b"payload".to_vec(),
    }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5 seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the consumer's first (or next) channel session is live.
pub async fn wait_ready(consumer: &Consumer) {
    wait_until(|| !consumer.consumer_tag().is_empty()).await;
}
