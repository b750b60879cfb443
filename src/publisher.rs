/// Standalone SNS Publisher
/// Run with: cargo run --bin publisher
///
/// Set TRACEPARENT to continue an upstream trace instead of starting one.
use anyhow::Result;
use aws_sdk_sns::Client as SnsClient;
use sns_sqs_tracing::config::AppConfig;
use sns_sqs_tracing::pipeline::Producer;
use sns_sqs_tracing::{telemetry, Message};
use std::io::{self, Write};

#[tokio::main]
async fn main() -> Result<()> {
    println!("📤 SNS Publisher");
    println!("================\n");

    let config = AppConfig::from_env()?;
    let _telemetry = telemetry::init(&config.service_name)?;

    let aws_config = aws_config::load_from_env().await;
    let producer = Producer::new(SnsClient::new(&aws_config), &config)?;

    println!("📌 Publishing to: {}", producer.topic_arn());
    if let Some(upstream) = &config.traceparent {
        println!("🧵 Continuing upstream trace: {upstream}");
    }
    println!();

    let mut message_id = 1;

    loop {
        print!("Enter message (or 'quit' to exit): ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("quit") {
            println!("👋 Goodbye!");
            break;
        }

        if input.is_empty() {
            continue;
        }

        let message = Message::new(message_id, input);
        match producer.publish(&message).await {
            Ok(sns_message_id) => {
                println!("✅ Published! MessageId: {sns_message_id}\n");
                message_id += 1;
            }
            Err(e) => {
                eprintln!("❌ Failed to publish: {e:#}\n");
            }
        }
    }

    Ok(())
}
