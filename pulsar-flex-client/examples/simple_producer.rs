//! Simple producer example using the pulsar-flex client

use pulsar_flex_client::*;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 pulsar-flex - Simple Producer Example");
    println!("========================================");

    let producer = ProducerBuilder::new()
        .discovery_servers(vec!["localhost:6650"])
        .topic("persistent://public/default/rust-sdk-topic")
        .access_mode(AccessMode::Shared)
        .create()
        .await?;

    println!(
        "✅ Registered as {} (next sequence id {})",
        producer.producer_name().unwrap_or_default(),
        producer.next_sequence_id()
    );

    // Example 1: Simple message
    let receipt = producer
        .send_message(ProducerMessage::new("Hello from Rust!"))
        .await?;
    println!(
        "✅ Sent simple message - sequence: {}, ledger: {}, entry: {}",
        receipt.sequence_id, receipt.ledger_id, receipt.entry_id
    );

    // Example 2: Message with properties
    let message = ProducerMessage::new("Order created: $99.99")
        .with_property("content-type", "application/json")
        .with_property("source", "web-app");
    let receipt = producer.send_message(message).await?;
    println!("✅ Sent message with properties - sequence: {}", receipt.sequence_id);

    // Example 3: Batch occupying a single sequence id
    let batch = vec![
        ProducerMessage::new("First message in batch"),
        ProducerMessage::new("Second message in batch"),
        ProducerMessage::new("Third message in batch"),
    ];
    let receipt = producer.send_batch(batch).await?;
    println!("✅ Sent batch of 3 messages - sequence: {}", receipt.sequence_id);

    // Example 4: Concurrent sends keep call order
    println!("\n🚀 Sending 1000 messages concurrently...");
    let start = Instant::now();

    let handles: Vec<_> = (0..1000)
        .map(|i| {
            let producer = producer.clone();
            tokio::spawn(async move {
                let message = ProducerMessage::new(format!("High-throughput message #{}", i));
                if let Err(e) = producer.send_message(message).await {
                    eprintln!("Error sending message {}: {}", i, e);
                }
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.await;
    }

    let elapsed = start.elapsed();
    println!(
        "✅ Completed in {:?} (~{:.0} msg/sec)",
        elapsed,
        1000.0 / elapsed.as_secs_f64()
    );

    let metrics = producer.metrics();
    println!(
        "📊 sent={} retries={} reconnects={} avg latency={:.0}us",
        metrics.messages_sent,
        metrics.send_retries,
        metrics.reconnects,
        metrics.average_send_latency_us
    );

    producer.close().await?;
    println!("✅ Producer closed");

    Ok(())
}
