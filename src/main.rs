use anyhow::Result;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::Client as SqsClient;
use sns_sqs_tracing::config::AppConfig;
use sns_sqs_tracing::pipeline::{Consumer, Producer};
use sns_sqs_tracing::{telemetry, Message};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info_span, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    println!("🚀 SNS/SQS Trace Propagation Example\n");

    let config = AppConfig::from_env()?;
    let _telemetry = telemetry::init(&config.service_name)?;

    // Load AWS configuration
    let aws_config = aws_config::load_from_env().await;
    let producer = Producer::new(SnsClient::new(&aws_config), &config)?;
    let consumer = Consumer::new(SqsClient::new(&aws_config), &config)?.with_wait_time_seconds(10);

    println!("📌 SNS Topic ARN: {}", producer.topic_arn());
    println!("📌 SQS Queue URL: {}\n", consumer.queue_url());

    // One trace for the whole publishing run, so every message carries its id
    println!("--- Publishing Messages ---");
    async {
        for i in 1..=3 {
            let message = Message::new(i, format!("Test message number {i}"));
            let message_id = producer.publish(&message).await?;
            println!("✅ Published message {i} to SNS. MessageId: {message_id}");
            sleep(Duration::from_millis(500)).await;
        }
        anyhow::Ok(())
    }
    .instrument(info_span!("demo.publish"))
    .await?;

    println!("\n--- Consuming Messages ---");
    // Wait a bit for messages to propagate
    sleep(Duration::from_secs(2)).await;

    for _ in 0..3 {
        println!("🔍 Polling SQS queue for messages...");
        let summary = consumer.poll_once().await?;
        if summary.received == 0 {
            println!("📭 No messages received");
        } else {
            println!(
                "🗑️  {} of {} messages deleted from queue",
                summary.deleted, summary.received
            );
        }
        sleep(Duration::from_secs(1)).await;
    }

    println!("\n✨ Example completed successfully!");
    Ok(())
}
