//! The task that owns a consumer's lifecycle and dispatch loop.
//!
//! One actor per consumer, spawned at build time. It is the only writer of
//! the lifecycle phase and the only caller of ack/nack, which is what makes
//! the once-per-message settlement guarantee hold without locks around the
//! wire.

use std::collections::VecDeque;
use std::sync::Arc;

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use crate::consumer::error::ConsumerError;
use crate::consumer::events::ConsumerEvent;
use crate::consumer::handler::{Handler, Incoming};
use crate::consumer::outcome::{decide, ConsumerStatus};
use crate::consumer::props::ConsumerProps;
use crate::consumer::reply::Replier;
use crate::consumer::setup::{self, SessionStart};
use crate::consumer::{Phase, Shared};
use crate::message::Message;
use crate::transport::{ChannelError, ChannelEvent, ChannelSource, DynChannel};

/// A handler invocation that has run to completion (or panicked), tagged
/// with the channel session it was dispatched under.
struct Settled {
    epoch: u64,
    delivery_tag: u64,
    outcome: Result<Option<ConsumerStatus>, anyhow::Error>,
}

enum SetupEnd {
    Ready(SessionStart),
    Close,
    /// The connection is gone for good; no further sessions are possible.
    Fatal,
}

enum SessionEnd {
    /// The channel died or the broker cancelled us; replay setup on a fresh
    /// channel.
    Reset,
    Close,
}

enum RetryEnd {
    Elapsed,
    Close,
}

pub(super) struct Actor {
    props: ConsumerProps,
    handler: Arc<dyn Handler>,
    source: Arc<dyn ChannelSource>,
    shared: Arc<Shared>,
    close_rx: watch::Receiver<bool>,
    /// Deliveries waiting for a free handler slot.
    buffer: VecDeque<Message>,
    in_flight: FuturesUnordered<Pin<Box<dyn Future<Output = Settled> + Send + Sync + 'static>>>,
    /// Bumped on every channel rollover; settlements carrying an older epoch
    /// belong to a dead channel and never reach the wire.
    epoch: u64,
}

impl Actor {
    pub(super) fn new(
        props: ConsumerProps,
        handler: Arc<dyn Handler>,
        source: Arc<dyn ChannelSource>,
        shared: Arc<Shared>,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            props,
            handler,
            source,
            shared,
            close_rx,
            buffer: VecDeque::new(),
            in_flight: FuturesUnordered::new(),
            epoch: 0,
        }
    }

    #[tracing::instrument(skip_all, fields(queue = %self.props.queue))]
    pub(super) async fn run(mut self) {
        loop {
            match self.setting_up().await {
                SetupEnd::Ready(session) => {
                    self.shared.set_phase(Phase::Ready);
                    self.shared.events.publish(ConsumerEvent::Ready);
                    match self.ready(session).await {
                        SessionEnd::Reset => self.rollover(),
                        SessionEnd::Close => break,
                    }
                }
                SetupEnd::Close | SetupEnd::Fatal => break,
            }
        }
        self.closing().await;
    }

    /// Acquire a channel and replay the setup plan, retrying until it
    /// succeeds, the consumer is closed, or the connection shuts down.
    async fn setting_up(&mut self) -> SetupEnd {
        self.shared.set_phase(Phase::SettingUp);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = close_requested(&mut self.close_rx) => None,
                result = attempt_session(self.source.as_ref(), &self.props) => Some(result),
            };
            match attempt {
                None => return SetupEnd::Close,
                Some(Ok((channel, session))) => {
                    self.shared.set_identity(&session.queue, &session.consumer_tag);
                    self.shared
                        .stats
                        .set_initial_message_count(session.message_count);
                    self.shared.install_channel(channel);
                    return SetupEnd::Ready(session);
                }
                Some(Err(error @ ChannelError::ConnectionClosed)) => {
                    let error = Arc::new(error);
                    self.shared
                        .set_fatal(ConsumerError::ConnectionShutdown(error.clone()));
                    self.shared
                        .events
                        .publish(ConsumerEvent::Error(ConsumerError::ConnectionShutdown(
                            error,
                        )));
                    return SetupEnd::Fatal;
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "channel session setup failed, retrying");
                    self.shared
                        .events
                        .publish(ConsumerEvent::Error(ConsumerError::Setup(Arc::new(error))));
                    if let RetryEnd::Close = self.wait_retry().await {
                        return SetupEnd::Close;
                    }
                }
            }
        }
    }

    /// Sleep out the retry delay without stalling already-running handlers.
    async fn wait_retry(&mut self) -> RetryEnd {
        // In no-ack mode the buffer may hold deliveries the broker has
        // already forgotten; keep them moving while the channel is down.
        self.pump();
        let delay = tokio::time::sleep(self.source.retry_delay());
        tokio::pin!(delay);
        loop {
            tokio::select! {
                biased;
                _ = close_requested(&mut self.close_rx) => return RetryEnd::Close,
                _ = &mut delay => return RetryEnd::Elapsed,
                Some(settled) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.settle(settled).await;
                    self.pump();
                }
            }
        }
    }

    /// The steady state: pull channel events, dispatch buffered deliveries,
    /// settle finished handlers.
    async fn ready(&mut self, mut session: SessionStart) -> SessionEnd {
        loop {
            self.pump();
            let event = tokio::select! {
                biased;
                _ = close_requested(&mut self.close_rx) => return SessionEnd::Close,
                Some(settled) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.settle(settled).await;
                    continue;
                }
                event = session.events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Delivery(message)) => {
                    self.shared.stats.prefetched_inc();
                    self.buffer.push_back(message);
                }
                Some(ChannelEvent::Cancelled) => {
                    tracing::warn!("the broker cancelled the consumer, resubscribing");
                    self.shared
                        .events
                        .publish(ConsumerEvent::Error(ConsumerError::Cancelled));
                    return SessionEnd::Reset;
                }
                Some(ChannelEvent::Closed(error)) => {
                    tracing::warn!(error = %error, "channel lost, resubscribing");
                    self.shared
                        .events
                        .publish(ConsumerEvent::Error(ConsumerError::ChannelLost(Arc::new(
                            error,
                        ))));
                    return SessionEnd::Reset;
                }
                None => {
                    self.shared
                        .events
                        .publish(ConsumerEvent::Error(ConsumerError::ChannelLost(Arc::new(
                            ChannelError::ChannelClosed,
                        ))));
                    return SessionEnd::Reset;
                }
            }
        }
    }

    /// Invalidate the dead channel session before setting up the next one.
    ///
    /// In acknowledged mode buffered deliveries die with their channel: the
    /// broker owns them again and will redeliver. In no-ack mode the broker
    /// has already forgotten them, so the buffer is the only copy and is
    /// kept.
    fn rollover(&mut self) {
        self.epoch += 1;
        self.shared.clear_channel();
        if !self.props.no_ack {
            let orphaned = self.buffer.len();
            self.buffer.clear();
            self.shared.stats.reset_prefetched(0);
            if orphaned > 0 {
                tracing::debug!(orphaned, "discarded buffered deliveries from the dead channel");
            }
        }
    }

    /// Apply the decision for one settled handler invocation.
    ///
    /// Evaluated exactly once per delivered message. Decisions from a
    /// previous channel session are discarded: their delivery tags mean
    /// nothing on the current channel and the broker redelivers the
    /// messages anyway.
    async fn settle(&self, settled: Settled) {
        let status = decide(&settled.outcome, self.props.requeue_on_error);
        if let Err(error) = settled.outcome {
            tracing::warn!(
                error = %error,
                delivery_tag = settled.delivery_tag,
                "message handler failed"
            );
            self.shared
                .events
                .publish(ConsumerEvent::Error(ConsumerError::Handler(Arc::new(error))));
        }
        if !self.props.no_ack {
            if settled.epoch != self.epoch {
                tracing::debug!(
                    delivery_tag = settled.delivery_tag,
                    "discarding decision for a delivery from a previous channel session"
                );
                return;
            }
            let Some(channel) = self.shared.current_channel() else {
                return;
            };
            let result = match status {
                ConsumerStatus::Ack => channel.basic_ack(settled.delivery_tag).await,
                ConsumerStatus::Requeue => channel.basic_nack(settled.delivery_tag, true).await,
                ConsumerStatus::Drop => channel.basic_nack(settled.delivery_tag, false).await,
            };
            if let Err(error) = result {
                tracing::warn!(
                    error = %error,
                    delivery_tag = settled.delivery_tag,
                    "failed to settle message on the wire"
                );
                return;
            }
        }
        self.shared.stats.record(status);
    }

    /// Move buffered deliveries into handler slots until the concurrency
    /// budget is exhausted or the buffer runs dry.
    fn pump(&mut self) {
        while self.in_flight.len() < self.shared.budget() {
            let Some(message) = self.buffer.pop_front() else {
                break;
            };
            self.shared.stats.prefetched_dec();
            self.dispatch(message);
        }
    }

    /// Run the handler on its own task so a panic poisons neither the
    /// dispatch loop nor sibling invocations.
    fn dispatch(&mut self, message: Message) {
        let epoch = self.epoch;
        let delivery_tag = message.delivery_tag;
        let incoming = Incoming {
            replier: Replier::for_message(self.shared.clone(), &message),
            queue_name: self.shared.queue(),
            message,
        };
        let handler = self.handler.clone();
        let task = tokio::spawn(async move { handler.handle(incoming).await });
        self.in_flight.push(Box::pin(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(anyhow::anyhow!("message handler panicked: {join_error}")),
            };
            Settled {
                epoch,
                delivery_tag,
                outcome,
            }
        }));
    }

    /// Drain in-flight handlers, settle them, then tear the channel down.
    ///
    /// No new deliveries are accepted, but in no-ack mode the buffer keeps
    /// draining through handlers: those messages exist nowhere else.
    async fn closing(&mut self) {
        self.shared.set_phase(Phase::Closing);
        loop {
            if self.props.no_ack {
                self.pump();
            }
            match self.in_flight.next().await {
                Some(settled) => self.settle(settled).await,
                None => {
                    if self.props.no_ack && !self.buffer.is_empty() {
                        continue;
                    }
                    break;
                }
            }
        }
        if let Some(channel) = self.shared.take_channel() {
            let consumer_tag = self.shared.consumer_tag();
            if !consumer_tag.is_empty() {
                if let Err(error) = channel.basic_cancel(&consumer_tag).await {
                    tracing::warn!(error = %error, "failed to cancel the subscription during close");
                }
            }
            if let Err(error) = channel.close().await {
                tracing::warn!(error = %error, "failed to close the channel");
            }
        }
        tracing::debug!("consumer closed");
        self.shared.set_phase(Phase::Closed);
    }
}

async fn attempt_session(
    source: &dyn ChannelSource,
    props: &ConsumerProps,
) -> Result<(DynChannel, SessionStart), ChannelError> {
    let channel = source.acquire().await?;
    let session = setup::replay(channel.as_ref(), props).await?;
    Ok((channel, session))
}

/// Resolves when the consumer handle requests a close, or is dropped.
async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|&requested| requested).await;
}
