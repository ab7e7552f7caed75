//! A self-healing queue consumer.
//!
//! [`Consumer`] subscribes to a queue and keeps the subscription alive
//! across channel failures by replaying its declarative setup on a fresh
//! channel. Message handling runs through a [`Handler`] under a bounded
//! concurrency budget; each delivery is acked or nacked exactly once, based
//! on the handler's outcome.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use amq_protocol_types::FieldTable;
use tokio::sync::{broadcast, watch};

use crate::topology::{
    ExchangeBinding, ExchangeOptions, QosOptions, QueueBinding, QueueOptions,
};
use crate::transport::{ChannelSource, DynChannel};

mod actor;
mod error;
mod events;
mod handler;
mod outcome;
mod props;
mod reply;
mod setup;
mod stats;

pub use error::{ConsumerError, ReplyError};
pub use events::ConsumerEvent;
pub use handler::{ClosureHandler, Handler, Incoming};
pub use outcome::ConsumerStatus;
pub use reply::Replier;
pub use stats::Stats;

use actor::Actor;
use events::EventBus;
use props::ConsumerProps;
use stats::StatsCounter;

/// Where a consumer currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    SettingUp,
    Ready,
    Closing,
    Closed,
}

#[derive(Debug, Default)]
struct Identity {
    queue: String,
    consumer_tag: String,
}

/// State shared between the consumer handle, its repliers and the actor
/// task.
pub(crate) struct Shared {
    /// The live channel, swapped out on every rollover. Repliers and the
    /// settle path read it; only the actor writes it.
    channel: Mutex<Option<DynChannel>>,
    identity: Mutex<Identity>,
    pub(crate) stats: StatsCounter,
    /// Handler-slot budget. `usize::MAX` encodes "unbounded".
    concurrency: AtomicUsize,
    pub(crate) events: EventBus,
    phase: watch::Sender<Phase>,
    fatal: Mutex<Option<ConsumerError>>,
}

/// Waiting on a lock held only for plain field reads and writes; a poisoned
/// lock still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn current_channel(&self) -> Option<DynChannel> {
        lock(&self.channel).clone()
    }

    fn install_channel(&self, channel: DynChannel) {
        *lock(&self.channel) = Some(channel);
    }

    fn clear_channel(&self) {
        *lock(&self.channel) = None;
    }

    fn take_channel(&self) -> Option<DynChannel> {
        lock(&self.channel).take()
    }

    fn set_identity(&self, queue: &str, consumer_tag: &str) {
        let mut identity = lock(&self.identity);
        identity.queue = queue.to_owned();
        identity.consumer_tag = consumer_tag.to_owned();
    }

    pub(crate) fn queue(&self) -> String {
        lock(&self.identity).queue.clone()
    }

    fn consumer_tag(&self) -> String {
        lock(&self.identity).consumer_tag.clone()
    }

    /// The number of handler slots the dispatch loop may fill.
    fn budget(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed).max(1)
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn set_fatal(&self, error: ConsumerError) {
        *lock(&self.fatal) = Some(error);
    }

    fn fatal(&self) -> Option<ConsumerError> {
        lock(&self.fatal).clone()
    }
}

/// A handle to a running consumer.
///
/// Built via [`Consumer::builder`]. The consumer keeps running until
/// [`close`](Consumer::close) is called or the handle is dropped; channel
/// failures are healed internally by replaying the setup on a fresh channel.
pub struct Consumer {
    shared: Arc<Shared>,
    close_tx: watch::Sender<bool>,
    phase_rx: watch::Receiver<Phase>,
}

impl Consumer {
    /// Start describing a consumer for `queue`.
    ///
    /// Pass an empty queue name to have the broker generate one; the
    /// resolved name is available via [`queue`](Consumer::queue) once the
    /// consumer is ready.
    pub fn builder(source: Arc<dyn ChannelSource>, queue: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder {
            source,
            props: ConsumerProps::new(queue.into()),
        }
    }

    /// The resolved queue name of the current channel session.
    pub fn queue(&self) -> String {
        self.shared.queue()
    }

    /// The consumer tag of the current channel session. Empty until the
    /// first session is up; regenerated on every rollover.
    pub fn consumer_tag(&self) -> String {
        self.shared.consumer_tag()
    }

    pub fn stats(&self) -> Stats {
        self.shared.stats.snapshot()
    }

    /// The current concurrency budget; `None` is unbounded.
    pub fn concurrency(&self) -> Option<usize> {
        match self.shared.concurrency.load(Ordering::Relaxed) {
            usize::MAX => None,
            n => Some(n),
        }
    }

    /// Retune the concurrency budget at runtime.
    ///
    /// Takes effect at the next dispatch: a lowered budget never interrupts
    /// handlers that are already running.
    pub fn set_concurrency(&self, concurrency: Option<usize>) {
        let raw = concurrency.map_or(usize::MAX, |n| n.max(1));
        self.shared.concurrency.store(raw, Ordering::Relaxed);
    }

    /// Subscribe to lifecycle events.
    ///
    /// Only events published after the call are observed; subscribe before
    /// awaiting anything if the first [`ConsumerEvent::Ready`] matters.
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.shared.events.subscribe()
    }

    /// Close the consumer: stop accepting deliveries, wait for in-flight
    /// handlers to settle, then tear the channel down.
    ///
    /// Idempotent. Returns an error only if the consumer had already died
    /// terminally, i.e. its connection shut down.
    pub async fn close(&mut self) -> Result<(), ConsumerError> {
        let _ = self.close_tx.send(true);
        let _ = self
            .phase_rx
            .wait_for(|phase| *phase == Phase::Closed)
            .await;
        match self.shared.fatal() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Fluent description of a consumer; finalized by [`handler`] or
/// [`raw_handler`], which start the consumer immediately.
///
/// [`handler`]: ConsumerBuilder::handler
/// [`raw_handler`]: ConsumerBuilder::raw_handler
pub struct ConsumerBuilder {
    source: Arc<dyn ChannelSource>,
    props: ConsumerProps,
}

impl ConsumerBuilder {
    /// Bound the number of concurrently running handler invocations.
    /// Clamped to at least 1. The default is unbounded.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.props.concurrency = Some(concurrency.max(1));
        self
    }

    /// Choose what happens to a message whose handler failed: requeue it
    /// (the default) or drop it.
    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.props.requeue_on_error = requeue;
        self
    }

    /// Consume without broker-side acknowledgements. The broker considers a
    /// message settled the moment it is pushed; handler outcomes only feed
    /// the stats.
    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.props.no_ack = no_ack;
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.props.queue_options = options;
        self
    }

    /// Ask the broker to limit unacknowledged deliveries on the channel.
    pub fn qos(mut self, qos: QosOptions) -> Self {
        self.props.qos = Some(qos);
        self
    }

    /// Declare an exchange as part of the consumer's setup. Can be called
    /// multiple times; declarations run in call order on every session.
    pub fn exchange(mut self, exchange: ExchangeOptions) -> Self {
        self.props.exchanges.push(exchange);
        self
    }

    /// Bind the consumed queue to an exchange as part of the setup.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.props.queue_bindings.push(binding);
        self
    }

    /// Bind one exchange to another as part of the setup.
    pub fn exchange_binding(mut self, binding: ExchangeBinding) -> Self {
        self.props.exchange_bindings.push(binding);
        self
    }

    /// Consumer priority. See <https://www.rabbitmq.com/consumer-priority.html>.
    pub fn priority(mut self, priority: i32) -> Self {
        self.props.priority = Some(priority);
        self
    }

    /// Extra arguments passed verbatim to `basic.consume`.
    pub fn consume_arguments(mut self, arguments: FieldTable) -> Self {
        self.props.consume_arguments = arguments;
        self
    }

    /// Finalize with an async closure and start the consumer.
    pub fn handler<F, Fut, Err>(self, handler: F) -> Consumer
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ConsumerStatus>, Err>> + Send + 'static,
        Err: Into<anyhow::Error> + Send + 'static,
    {
        self.raw_handler(ClosureHandler(handler))
    }

    /// Finalize with a [`Handler`] implementation and start the consumer.
    pub fn raw_handler<H: Handler>(self, handler: H) -> Consumer {
        let (phase_tx, phase_rx) = watch::channel(Phase::SettingUp);
        let concurrency = self.props.concurrency.map_or(usize::MAX, |n| n.max(1));
        let shared = Arc::new(Shared {
            channel: Mutex::new(None),
            identity: Mutex::new(Identity {
                queue: self.props.queue.clone(),
                consumer_tag: String::new(),
            }),
            stats: StatsCounter::default(),
            concurrency: AtomicUsize::new(concurrency),
            events: EventBus::new(32),
            phase: phase_tx,
            fatal: Mutex::new(None),
        });
        let (close_tx, close_rx) = watch::channel(false);
        let actor = Actor::new(
            self.props,
            Arc::new(handler),
            self.source,
            shared.clone(),
            close_rx,
        );
        tokio::spawn(actor.run());
        Consumer {
            shared,
            close_tx,
            phase_rx,
        }
    }
}
