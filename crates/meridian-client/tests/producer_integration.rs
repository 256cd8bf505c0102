//! Integration tests for the Producer → partition connection flow.
//!
//! These tests drive the whole publish path against the in-memory broker:
//! 1. Producer routes and admits messages via send_async()
//! 2. BatchContainer accumulates per partition
//! 3. Count, size, delay, flush() and close() triggers form frames
//! 4. The dispatcher hands frames to the partition connection
//! 5. Acks, failures and timeouts resolve every message handle

use meridian_client::{
    AckMode, ClientError, CompressionType, CryptoFailureAction, Encryption, InMemoryBroker,
    MessageCrypto, OutgoingMessage, Producer, ProducerConfig, ProducerConfigBuilder, RetryPolicy,
    StaticKeyReader,
};
use meridian_core::decode_entries;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "orders";

/// Builder with fail-fast lookup and a publish delay long enough that only
/// the trigger under test forms batches.
fn builder() -> ProducerConfigBuilder {
    ProducerConfig::builder()
        .topic(TOPIC)
        .lookup_retry(RetryPolicy::none())
        .batching_max_publish_delay(Duration::from_secs(60))
}

async fn create(broker: &InMemoryBroker, builder: ProducerConfigBuilder) -> Producer {
    builder
        .create(Arc::new(broker.clone()), Arc::new(broker.clone()))
        .await
        .unwrap()
}

/// Wait until the broker holds `n` unacknowledged frames.
async fn wait_for_held(broker: &InMemoryBroker, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.held_acks() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("broker never received the expected frames");
}

#[tokio::test]
async fn test_count_trigger_and_flush_form_expected_batches() {
    let broker = InMemoryBroker::new();
    let producer = create(&broker, builder().batching_max_messages(5)).await;

    let mut handles = Vec::new();
    for i in 0..12 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    producer.flush().await.unwrap();

    let sizes: Vec<u32> = broker.frames().iter().map(|f| f.num_messages).collect();
    assert_eq!(sizes, vec![5, 5, 2]);

    let frames = broker.frames();
    assert_eq!(frames[0].sequence_range(), 0..=4);
    assert_eq!(frames[1].sequence_range(), 5..=9);
    assert_eq!(frames[2].sequence_range(), 10..=11);

    for handle in handles {
        handle.await.unwrap();
    }
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_delay_trigger_flushes_partial_batch() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder()
            .batching_max_messages(100)
            .batching_max_publish_delay(Duration::from_millis(20)),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    assert!(broker.frames().is_empty());

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
    let frames = broker.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].num_messages, 3);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_size_trigger_flushes_before_overflow() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder().batching_max_messages(1000).batching_max_bytes(256),
    )
    .await;

    let payload = vec![b'x'; 100];
    for _ in 0..5 {
        let _ = producer.send_async(OutgoingMessage::new(payload.clone())).await;
    }
    producer.flush().await.unwrap();

    let frames = broker.frames();
    assert!(frames.len() >= 3, "expected size-bound batches, got {}", frames.len());
    for frame in &frames {
        assert!(frame.uncompressed_size as usize <= 256);
    }
    assert_eq!(frames.iter().map(|f| f.num_messages).sum::<u32>(), 5);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_queue_full_rejects_without_blocking() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = create(
        &broker,
        builder()
            .batching_enabled(false)
            .max_pending_messages(1)
            .block_if_queue_full(false),
    )
    .await;

    let first = producer.send_async(OutgoingMessage::new("a")).await;
    let rejected = producer.send_async(OutgoingMessage::new("b")).await;
    assert_eq!(rejected.sequence_id(), None);
    assert!(matches!(rejected.await, Err(ClientError::QueueFull { partition: 0 })));

    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    first.await.unwrap();

    let third = producer.send_async(OutgoingMessage::new("c")).await;
    assert_eq!(third.sequence_id(), Some(1));
    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    third.await.unwrap();

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_send_resumes_when_slot_frees() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = Arc::new(
        create(
            &broker,
            builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .block_if_queue_full(true),
        )
        .await,
    );

    let first = producer.send_async(OutgoingMessage::new("a")).await;

    let blocked = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.send_async(OutgoingMessage::new("b")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished());

    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    first.await.unwrap();

    let second = blocked.await.unwrap();
    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    second.await.unwrap();

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_blocked_send_interrupted_by_cancellation() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = Arc::new(
        create(
            &broker,
            builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .block_if_queue_full(true),
        )
        .await,
    );

    let first = producer.send_async(OutgoingMessage::new("a")).await;

    let token = CancellationToken::new();
    let blocked = {
        let producer = Arc::clone(&producer);
        let token = token.clone();
        tokio::spawn(async move {
            producer
                .send_async_cancellable(OutgoingMessage::new("b"), &token)
                .await
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    assert!(matches!(blocked.await.unwrap(), Err(ClientError::Interrupted)));

    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    first.await.unwrap();
    assert_eq!(producer.pending_messages(), 0);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_blocked_send() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = Arc::new(
        create(
            &broker,
            builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .block_if_queue_full(true),
        )
        .await,
    );

    let first = producer.send_async(OutgoingMessage::new("a")).await;
    let blocked = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.send(OutgoingMessage::new("b")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let closing = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.close().await })
    };
    assert!(matches!(blocked.await.unwrap(), Err(ClientError::Interrupted)));

    wait_for_held(&broker, 1).await;
    broker.release_acks(1);
    first.await.unwrap();
    closing.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_timeout_fails_message_and_frees_slot() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Never);
    let producer = create(
        &broker,
        builder()
            .batching_enabled(false)
            .max_pending_messages(1)
            .send_timeout(Duration::from_millis(50)),
    )
    .await;

    let result = tokio::time::timeout(Duration::from_secs(5), producer.send(OutgoingMessage::new("a")))
        .await
        .unwrap();
    assert!(matches!(result, Err(ClientError::Timeout(d)) if d == Duration::from_millis(50)));
    assert_eq!(producer.pending_messages(), 0);

    let next = producer.send_async(OutgoingMessage::new("b")).await;
    assert!(next.sequence_id().is_some());
    assert!(matches!(next.await, Err(ClientError::Timeout(_))));

    let stats = producer.stats();
    assert_eq!(stats.messages_timed_out, 2);
    assert_eq!(stats.messages_failed, 2);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_messages_are_dropped_from_unsent_batch() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder()
            .batching_max_messages(100)
            .send_timeout(Duration::from_millis(30)),
    )
    .await;

    let handle = producer.send_async(OutgoingMessage::new("stale")).await;
    assert!(matches!(handle.await, Err(ClientError::Timeout(_))));

    producer.flush().await.unwrap();
    assert!(broker.frames().is_empty());

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_outstanding_messages() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = Arc::new(create(&broker, builder().batching_enabled(false)).await);

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }

    let closing = {
        let producer = Arc::clone(&producer);
        tokio::spawn(async move { producer.close().await })
    };
    wait_for_held(&broker, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!closing.is_finished());
    assert!(producer.is_closed());

    broker.release_all_acks();
    closing.await.unwrap().unwrap();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(broker.connections_closed(), broker.connections_opened());
}

#[tokio::test]
async fn test_close_flushes_accumulating_batch() {
    let broker = InMemoryBroker::new();
    let producer = create(&broker, builder().batching_max_messages(100)).await;

    let handle = producer.send_async(OutgoingMessage::new("last words")).await;
    producer.close().await.unwrap();

    assert!(handle.await.is_ok());
    assert_eq!(broker.frames().len(), 1);
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_new_sends() {
    let broker = InMemoryBroker::new();
    let producer = create(&broker, builder()).await;

    producer.close().await.unwrap();
    producer.close().await.unwrap();

    assert!(matches!(
        producer.send(OutgoingMessage::new("late")).await,
        Err(ClientError::AlreadyClosed)
    ));
    assert!(matches!(producer.flush().await, Err(ClientError::AlreadyClosed)));
    assert_eq!(producer.stats().messages_sent, 0);
}

#[tokio::test]
async fn test_completions_follow_enqueue_order() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = create(&broker, builder().batching_enabled(false)).await;

    let mut handles = Vec::new();
    for i in 0..10 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    wait_for_held(&broker, 10).await;
    broker.release_all_acks();

    let mut last_entry = None;
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.sequence_id(), Some(i as u64));
        let id = handle.await.unwrap();
        assert!(last_entry.map_or(true, |last| id.entry_id > last));
        last_entry = Some(id.entry_id);
    }

    let payloads: Vec<_> = broker
        .entries()
        .unwrap()
        .into_iter()
        .map(|e| e.payload)
        .collect();
    let expected: Vec<_> = (0..10).map(|i| bytes::Bytes::from(format!("msg-{}", i))).collect();
    assert_eq!(payloads, expected);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_broker_failure_fails_every_batch_member() {
    let broker = InMemoryBroker::new().with_ack_mode(AckMode::Manual);
    let producer = create(&broker, builder().batching_max_messages(3)).await;

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    wait_for_held(&broker, 1).await;
    broker.fail_held(1, "not leader");

    for handle in handles {
        assert!(matches!(handle.await, Err(ClientError::Transport { .. })));
    }
    let stats = producer.stats();
    assert_eq!(stats.messages_failed, 3);
    assert_eq!(producer.pending_messages(), 0);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_encrypted_batch_round_trip() {
    let broker = InMemoryBroker::new();
    let keys = Arc::new(StaticKeyReader::new().with_key("orders-key", [7u8; 32]));
    let producer = create(
        &broker,
        builder()
            .batching_max_messages(2)
            .compression(CompressionType::Zstd)
            .crypto_key_reader(keys.clone())
            .add_encryption_key("orders-key"),
    )
    .await;

    let first = producer.send_async(OutgoingMessage::new("secret-1").key("k")).await;
    let second = producer.send_async(OutgoingMessage::new("secret-2")).await;
    first.await.unwrap();
    second.await.unwrap();

    let frames = broker.frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    let Encryption::Sealed(metadata) = &frame.encryption else {
        panic!("expected sealed frame, got {:?}", frame.encryption);
    };
    assert_eq!(metadata.keys.len(), 1);
    assert_eq!(metadata.keys[0].key_name, "orders-key");
    assert!(frame.entries().is_err());

    let compressed = MessageCrypto::decrypt(metadata, &frame.payload, keys.as_ref()).unwrap();
    let raw = frame.compression.decompress(&compressed).unwrap();
    assert_eq!(raw.len(), frame.uncompressed_size as usize);
    let entries = decode_entries(raw).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].payload, "secret-1");
    assert_eq!(entries[0].key.as_deref(), Some("k"));
    assert_eq!(entries[1].payload, "secret-2");

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_encryption_failure_fails_batch() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder()
            .batching_enabled(false)
            .crypto_key_reader(Arc::new(StaticKeyReader::new()))
            .add_encryption_key("missing")
            .crypto_failure_action(CryptoFailureAction::Fail),
    )
    .await;

    let result = producer.send(OutgoingMessage::new("a")).await;
    assert!(matches!(result, Err(ClientError::Encryption(_))));
    assert!(broker.frames().is_empty());
    assert_eq!(producer.stats().encryption_failures, 1);
    assert_eq!(producer.pending_messages(), 0);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_encryption_failure_fails_every_batch_member() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder()
            .batching_max_messages(3)
            .crypto_key_reader(Arc::new(StaticKeyReader::new()))
            .add_encryption_key("missing")
            .crypto_failure_action(CryptoFailureAction::Fail),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..3 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    for handle in handles {
        assert!(matches!(handle.await, Err(ClientError::Encryption(_))));
    }

    assert!(broker.frames().is_empty());
    assert_eq!(producer.pending_messages(), 0);
    let stats = producer.stats();
    assert_eq!(stats.encryption_failures, 1);
    assert_eq!(stats.messages_failed, 3);
    assert_eq!(stats.batches_sent, 0);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_encryption_failure_sends_unencrypted_when_configured() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder()
            .batching_enabled(false)
            .crypto_key_reader(Arc::new(StaticKeyReader::new()))
            .add_encryption_key("missing")
            .crypto_failure_action(CryptoFailureAction::Send),
    )
    .await;

    producer.send(OutgoingMessage::new("a")).await.unwrap();

    let frames = broker.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].encryption, Encryption::Bypassed);
    assert_eq!(broker.entries().unwrap()[0].payload, "a");
    assert_eq!(producer.stats().encryption_failures, 1);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_keyed_messages_stay_on_one_partition() {
    let broker = InMemoryBroker::new().with_topic(TOPIC, 4);
    let producer = create(&broker, builder().batching_enabled(false)).await;
    assert_eq!(producer.partition_count(), 4);

    let mut partitions = HashSet::new();
    for i in 0..20 {
        let id = producer
            .send(OutgoingMessage::new(format!("msg-{}", i)).key("user-1"))
            .await
            .unwrap();
        partitions.insert(id.partition);
    }
    assert_eq!(partitions.len(), 1);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_round_robin_spreads_unkeyed_messages() {
    let broker = InMemoryBroker::new().with_topic(TOPIC, 4);
    let producer = create(&broker, builder().batching_enabled(false)).await;

    for i in 0..8 {
        producer
            .send(OutgoingMessage::new(format!("msg-{}", i)))
            .await
            .unwrap();
    }
    for partition in 0..4 {
        assert_eq!(broker.frames_for(partition).len(), 2);
    }

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_sequence_ids_start_at_initial_and_honor_explicit_ids() {
    let broker = InMemoryBroker::new();
    let producer = create(
        &broker,
        builder().batching_enabled(false).initial_sequence_id(10),
    )
    .await;

    let first = producer.send_async(OutgoingMessage::new("a")).await;
    let explicit = producer
        .send_async(OutgoingMessage::new("b").sequence_id(500))
        .await;
    let next = producer.send_async(OutgoingMessage::new("c")).await;

    assert_eq!(first.sequence_id(), Some(10));
    assert_eq!(explicit.sequence_id(), Some(500));
    assert_eq!(next.sequence_id(), Some(11));
    assert_eq!(producer.last_sequence_id(), Some(11));

    producer.flush().await.unwrap();
    let sequence_ids: Vec<u64> = broker.frames().iter().map(|f| f.sequence_id).collect();
    assert_eq!(sequence_ids, vec![10, 500, 11]);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_partitioned_batches_carry_contiguous_ranges() {
    let broker = InMemoryBroker::new().with_topic(TOPIC, 2);
    let producer = create(&broker, builder().batching_max_messages(3)).await;

    let mut handles = Vec::new();
    for i in 0..6 {
        handles.push(producer.send_async(OutgoingMessage::new(format!("msg-{}", i))).await);
    }
    producer.flush().await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    let frames = broker.frames();
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        let ids: Vec<u64> = frame.entries().unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, frame.sequence_range().collect::<Vec<_>>());
        assert_eq!(
            frame.highest_sequence_id - frame.sequence_id + 1,
            frame.num_messages as u64
        );
        assert_eq!(frame.sequence_range(), 0..=2);
    }
    assert_eq!(producer.last_sequence_id(), Some(2));

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_senders() {
    let broker = InMemoryBroker::new().with_topic(TOPIC, 3);
    let producer = Arc::new(create(&broker, builder().batching_max_messages(16)).await);

    let tasks: Vec<_> = (0..8)
        .map(|t| {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move {
                let mut handles = Vec::new();
                for i in 0..50 {
                    handles.push(
                        producer
                            .send_async(OutgoingMessage::new(format!("{}-{}", t, i)))
                            .await,
                    );
                }
                handles
            })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.extend(task.await.unwrap());
    }
    producer.flush().await.unwrap();

    let mut sequence_ids = HashSet::new();
    for handle in handles {
        let key = (handle.partition().unwrap(), handle.sequence_id().unwrap());
        assert!(sequence_ids.insert(key));
        handle.await.unwrap();
    }
    assert_eq!(sequence_ids.len(), 400);
    for frame in broker.frames() {
        assert_eq!(
            frame.highest_sequence_id - frame.sequence_id + 1,
            frame.num_messages as u64
        );
    }
    assert_eq!(broker.entries().unwrap().len(), 400);
    assert_eq!(producer.stats().messages_acked, 400);

    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_lookup_failure_surfaces_transport_error() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);

    let result = builder()
        .create(Arc::new(broker.clone()), Arc::new(broker.clone()))
        .await;
    assert!(matches!(result, Err(ClientError::Transport { .. })));
    assert_eq!(broker.connections_opened(), 0);
}

#[tokio::test]
async fn test_lookup_retries_transient_failures() {
    let broker = InMemoryBroker::new().with_topic(TOPIC, 2);
    broker.fail_next_lookups(2);

    let producer = create(
        &broker,
        builder().lookup_retry(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )),
    )
    .await;

    assert_eq!(broker.lookups(), 3);
    assert_eq!(broker.connections_opened(), 2);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_topic_rejected_before_lookup() {
    let broker = InMemoryBroker::new();
    let result = ProducerConfig::builder()
        .topic("bad topic")
        .create(Arc::new(broker.clone()), Arc::new(broker.clone()))
        .await;

    assert!(matches!(result, Err(ClientError::Configuration(_))));
    assert_eq!(broker.lookups(), 0);
}
