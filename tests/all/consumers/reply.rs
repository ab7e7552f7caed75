//! Publishing responses through the `Replier`.

use std::time::Duration;

use tokio::sync::mpsc;
use warren::message::AMQPProperties;
use warren::{Consumer, ConsumerStatus, OutboundMessage, Replier, ReplyError};

use crate::helpers::{message_with, wait_ready, wait_until, MockChannel, MockConnection, WireCall};

fn rpc_request(delivery_tag: u64) -> warren::Message {
    message_with(
        delivery_tag,
        "orders",
        AMQPProperties::default()
            .with_reply_to("replies".into())
            .with_correlation_id("corr-1".into()),
    )
}

#[tokio::test]
async fn replies_target_the_reply_to_address_and_propagate_correlation() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let consumer = Consumer::builder(connection, "orders").handler(|incoming| async move {
        incoming.replier.reply(b"pong".to_vec()).await?;
        Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
    });
    wait_ready(&consumer).await;

    // Act
    channel.deliver(rpc_request(1));

    // Assert
    wait_until(|| consumer.stats().acknowledged == 1).await;
    assert!(channel.calls().contains(&WireCall::Publish {
        exchange: String::new(),
        routing_key: "replies".into(),
        correlation_id: Some("corr-1".into()),
        payload: b"pong".to_vec(),
    }));
}

#[tokio::test]
async fn a_custom_envelope_overrides_routing_and_correlation() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let consumer = Consumer::builder(connection, "orders").handler(|incoming| async move {
        let envelope = OutboundMessage::default()
            .with_payload(b"pong".to_vec())
            .with_routing_key("elsewhere")
            .with_correlation_id("custom".into());
        incoming.replier.reply_with(envelope).await?;
        Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
    });
    wait_ready(&consumer).await;

    // Act
    channel.deliver(rpc_request(1));

    // Assert
    wait_until(|| consumer.stats().acknowledged == 1).await;
    assert!(channel.calls().contains(&WireCall::Publish {
        exchange: String::new(),
        routing_key: "elsewhere".into(),
        correlation_id: Some("custom".into()),
        payload: b"pong".to_vec(),
    }));
}

#[tokio::test]
async fn replying_without_a_reply_to_address_fails() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<ReplyError>();
    let consumer = Consumer::builder(connection, "orders").handler({
        move |incoming: warren::Incoming| {
            let error_tx = error_tx.clone();
            async move {
                let error = incoming
                    .replier
                    .reply(b"pong".to_vec())
                    .await
                    .expect_err("the reply should have failed");
                error_tx.send(error).unwrap();
                Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
            }
        }
    });
    wait_ready(&consumer).await;

    // Act: the incoming message carries no reply-to property.
    channel.deliver(message_with(1, "orders", AMQPProperties::default()));

    // Assert
    let error = tokio::time::timeout(Duration::from_secs(5), error_rx.recv())
        .await
        .expect("no reply error within 5 seconds")
        .expect("the handler never ran");
    assert!(matches!(error, ReplyError::NoReplyAddress));
    let published = channel
        .calls()
        .iter()
        .any(|call| matches!(call, WireCall::Publish { .. }));
    assert!(!published);
}

#[tokio::test]
async fn replying_after_close_fails_with_channel_unavailable() {
    // Arrange: smuggle the replier out of the handler so it outlives the
    // consumer's channel.
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let (replier_tx, mut replier_rx) = mpsc::unbounded_channel::<Replier>();
    let mut consumer = Consumer::builder(connection, "orders").handler({
        move |incoming: warren::Incoming| {
            let replier_tx = replier_tx.clone();
            async move {
                replier_tx.send(incoming.replier.clone()).unwrap();
                Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
            }
        }
    });
    wait_ready(&consumer).await;
    channel.deliver(rpc_request(1));
    let replier = tokio::time::timeout(Duration::from_secs(5), replier_rx.recv())
        .await
        .expect("no replier within 5 seconds")
        .expect("the handler never ran");

    // Act
    consumer.close().await.expect("close failed");
    let result = replier.reply(b"pong".to_vec()).await;

    // Assert
    assert!(matches!(result, Err(ReplyError::ChannelUnavailable)));
}
