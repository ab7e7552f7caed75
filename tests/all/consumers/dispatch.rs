//! Buffering and the concurrency budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use warren::{Consumer, ConsumerStatus};

use crate::helpers::{message, wait_ready, wait_until, MockChannel, MockConnection};

#[tokio::test]
async fn the_concurrency_budget_bounds_parallel_handlers() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::builder(connection, "orders")
        .concurrency(2)
        .handler({
            let current = current.clone();
            let max_seen = max_seen.clone();
            move |_incoming| {
                let current = current.clone();
                let max_seen = max_seen.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
                }
            }
        });
    wait_ready(&consumer).await;

    // Act
    for delivery_tag in 1..=5 {
        channel.deliver(message(delivery_tag));
    }

    // Assert
    wait_until(|| consumer.stats().acknowledged == 5).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_single_slot_preserves_delivery_order() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = Consumer::builder(connection, "orders")
        .concurrency(1)
        .handler({
            let seen = seen.clone();
            move |incoming| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(incoming.message.delivery_tag);
                    Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
                }
            }
        });
    wait_ready(&consumer).await;

    // Act
    for delivery_tag in 1..=4 {
        channel.deliver(message(delivery_tag));
    }

    // Assert
    wait_until(|| consumer.stats().acknowledged == 4).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn unbounded_consumers_dispatch_everything_at_once() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let consumer = Consumer::builder(connection, "orders").handler({
        let current = current.clone();
        let max_seen = max_seen.clone();
        move |_incoming| {
            let current = current.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
            }
        }
    });
    assert_eq!(consumer.concurrency(), None);
    wait_ready(&consumer).await;

    // Act
    for delivery_tag in 1..=3 {
        channel.deliver(message(delivery_tag));
    }

    // Assert
    wait_until(|| consumer.stats().acknowledged == 3).await;
    assert_eq!(max_seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn the_prefetched_gauge_tracks_buffered_deliveries() {
    // Arrange
    let channel = MockChannel::new();
    let connection = MockConnection::new(vec![channel.clone()]);
    let gate = Arc::new(Semaphore::new(0));
    let consumer = Consumer::builder(connection, "orders")
        .concurrency(1)
        .handler({
            let gate = gate.clone();
            move |_incoming| {
                let gate = gate.clone();
                async move {
                    gate.acquire().await.unwrap().forget();
                    Ok::<Option<ConsumerStatus>, anyhow::Error>(None)
                }
            }
        });
    wait_ready(&consumer).await;

    // Act: one delivery occupies the single slot, two pile up in the buffer.
    for delivery_tag in 1..=3 {
        channel.deliver(message(delivery_tag));
    }

    // Assert
    wait_until(|| consumer.stats().prefetched == 2).await;
    gate.add_permits(3);
    wait_until(|| {
        let stats = consumer.stats();
        stats.acknowledged == 3 && stats.prefetched == 0
    })
    .await;
}

#[tokio::test]
async fn the_concurrency_budget_is_tunable_at_runtime() {
    // Arrange
    let connection = MockConnection::new(vec![MockChannel::new()]);
    let consumer = Consumer::builder(connection, "orders")
        .handler(|_incoming| async move { Ok::<Option<ConsumerStatus>, anyhow::Error>(None) });

    // Act + Assert
    assert_eq!(consumer.concurrency(), None);
    consumer.set_concurrency(Some(4));
    assert_eq!(consumer.concurrency(), Some(4));
    // Zero would deadlock the dispatch loop; it is clamped to one.
    consumer.set_concurrency(Some(0));
    assert_eq!(consumer.concurrency(), Some(1));
    consumer.set_concurrency(None);
    assert_eq!(consumer.concurrency(), None);
}
