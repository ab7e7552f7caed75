//! Publishing responses back to a message's `reply-to` address.

use std::sync::Arc;

use crate::consumer::error::ReplyError;
use crate::consumer::Shared;
use crate::message::{Message, OutboundMessage};

/// Publishes replies over the consumer's current channel.
///
/// Captured per message at dispatch time, so it stays usable after the
/// handler takes ownership of the [`Message`]. Cheap to clone; holding one
/// past the handler's lifetime is fine, though replies will fail with
/// [`ReplyError::ChannelUnavailable`] once the consumer is closed.
#[derive(Clone)]
pub struct Replier {
    shared: Arc<Shared>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
}

impl Replier {
    pub(crate) fn for_message(shared: Arc<Shared>, message: &Message) -> Self {
        Self {
            shared,
            reply_to: message.reply_to().map(str::to_owned),
            correlation_id: message.correlation_id().map(str::to_owned),
        }
    }

    /// Publish `payload` to the incoming message's `reply-to` queue,
    /// propagating its correlation id.
    pub async fn reply(&self, payload: Vec<u8>) -> Result<(), ReplyError> {
        self.reply_with(OutboundMessage::default().with_payload(payload))
            .await
    }

    /// Publish a fully customized reply.
    ///
    /// An empty routing key is filled in from the incoming message's
    /// `reply-to` address; a missing correlation id is propagated from the
    /// incoming message. Everything else is published as-is.
    pub async fn reply_with(&self, envelope: OutboundMessage) -> Result<(), ReplyError> {
        let channel = self
            .shared
            .current_channel()
            .ok_or(ReplyError::ChannelUnavailable)?;
        let mut outbound = envelope;
        if outbound.routing_key.is_empty() {
            match &self.reply_to {
                Some(reply_to) => outbound.routing_key = reply_to.clone(),
                None => return Err(ReplyError::NoReplyAddress),
            }
        }
        let caller_set_correlation = outbound
            .properties
            .as_ref()
            .is_some_and(|p| p.correlation_id().is_some());
        if !caller_set_correlation {
            if let Some(correlation_id) = &self.correlation_id {
                outbound = outbound.with_correlation_id(correlation_id.as_str().into());
            }
        }
        channel
            .basic_publish(outbound)
            .await
            .map_err(ReplyError::Publish)
    }
}
