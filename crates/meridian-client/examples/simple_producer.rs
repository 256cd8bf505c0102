//! Simple Producer Example
//!
//! This example demonstrates how to use the Meridian Producer API to publish
//! keyed, batched and encrypted messages against the in-memory broker.
//!
//! Run with:
//! ```bash
//! cargo run --package meridian-client --example simple_producer
//! ```

use meridian_client::{
    CompressionType, InMemoryBroker, MessageCrypto, OutgoingMessage, ProducerConfig,
    StaticKeyReader,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\nMeridian Producer Example");
    println!("=========================\n");

    // Step 1: Broker with a partitioned topic
    let broker = InMemoryBroker::new().with_topic("orders", 3);
    println!("Step 1: Created topic 'orders' with 3 partitions\n");

    // Step 2: Producer with batching, compression and encryption
    let keys = Arc::new(StaticKeyReader::new().with_key("orders-key", [42u8; 32]));
    let producer = ProducerConfig::builder()
        .topic("orders")
        .producer_name("example-producer")
        .batching_max_messages(10)
        .batching_max_publish_delay(Duration::from_millis(5))
        .compression(CompressionType::Lz4)
        .crypto_key_reader(keys.clone())
        .add_encryption_key("orders-key")
        .create(Arc::new(broker.clone()), Arc::new(broker.clone()))
        .await?;
    println!(
        "Step 2: Producer '{}' connected to {} partitions\n",
        producer.producer_name(),
        producer.partition_count()
    );

    // Step 3: Keyed messages, awaited one by one
    println!("Step 3: Sending keyed messages");
    for user in ["alice", "bob", "carol"] {
        let id = producer
            .send(OutgoingMessage::new(format!("order placed by {}", user)).key(user))
            .await?;
        println!("   {} -> {}", user, id);
    }

    // Step 4: A burst of unkeyed messages, collected afterwards
    println!("\nStep 4: Sending a burst of 50 messages");
    let mut handles = Vec::with_capacity(50);
    for i in 0..50 {
        handles.push(
            producer
                .send_async(OutgoingMessage::new(format!("event {}", i)).property("seq", i.to_string()))
                .await,
        );
    }
    producer.flush().await?;
    for handle in handles {
        handle.await?;
    }

    // Step 5: Inspect what reached the broker
    let frames = broker.frames();
    println!("\nStep 5: Broker received {} frames", frames.len());
    if let Some(frame) = frames.first() {
        if let meridian_client::Encryption::Sealed(metadata) = &frame.encryption {
            let compressed = MessageCrypto::decrypt(metadata, &frame.payload, keys.as_ref())?;
            let raw = frame.compression.decompress(&compressed)?;
            let entries = meridian_core::decode_entries(raw)?;
            println!(
                "   first frame: partition {}, {} messages, first payload {:?}",
                frame.partition,
                entries.len(),
                entries.first().map(|e| String::from_utf8_lossy(&e.payload).into_owned())
            );
        }
    }

    let stats = producer.stats();
    println!("\nStats: {}", serde_json::to_string_pretty(&stats)?);

    producer.close().await?;
    println!("\nProducer closed");
    Ok(())
}
