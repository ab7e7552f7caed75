//! Setup plan replay: the fixed sequence of declarations executed on every
//! fresh channel session.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::consumer::props::ConsumerProps;
use crate::transport::{ChannelError, ChannelEvent, ConsumerChannel};

/// What a successful replay hands back: the new session identity plus the
/// channel's inbound event stream.
pub(super) struct SessionStart {
    /// Resolved queue name - broker-generated when the configured name is
    /// empty.
    pub(super) queue: String,
    /// Resolved consumer tag, regenerated for every session.
    pub(super) consumer_tag: String,
    /// Queue depth at consume-start.
    pub(super) message_count: u32,
    pub(super) events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Replay the declarative setup on a fresh channel.
///
/// Order matters: bindings reference exchanges and queues that must already
/// exist. Any failure aborts the session; the caller retries on a new
/// channel after the connection's retry delay.
#[tracing::instrument(skip_all, fields(queue = %props.queue))]
pub(super) async fn replay(
    channel: &dyn ConsumerChannel,
    props: &ConsumerProps,
) -> Result<SessionStart, ChannelError> {
    for exchange in &props.exchanges {
        channel.exchange_declare(exchange).await?;
    }
    let queue = channel.queue_declare(&props.queue, &props.queue_options).await?;
    for binding in &props.queue_bindings {
        channel.queue_bind(&queue.name, binding).await?;
    }
    for binding in &props.exchange_bindings {
        channel.exchange_bind(binding).await?;
    }
    if let Some(qos) = &props.qos {
        channel.basic_qos(qos).await?;
    }
    let start = channel
        .basic_consume(
            &queue.name,
            &Uuid::new_v4().to_string(),
            &props.consume_options(),
        )
        .await?;
    tracing::debug!(
        queue = %queue.name,
        consumer_tag = %start.consumer_tag,
        message_count = queue.message_count,
        "consume started"
    );
    Ok(SessionStart {
        queue: queue.name,
        consumer_tag: start.consumer_tag,
        message_count: queue.message_count,
        events: start.events,
    })
}
