/// Standalone SQS Consumer
/// Run with: cargo run --bin consumer
use anyhow::{Context, Result};
use aws_sdk_sqs::Client as SqsClient;
use sns_sqs_tracing::config::AppConfig;
use sns_sqs_tracing::pipeline::Consumer;
use sns_sqs_tracing::telemetry;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    println!("📥 SQS Consumer");
    println!("===============\n");

    let config = AppConfig::from_env()?;
    let _telemetry = telemetry::init(&config.service_name)?;

    let aws_config = aws_config::load_from_env().await;
    let consumer = Consumer::new(SqsClient::new(&aws_config), &config)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))
        .context("Failed to install Ctrl+C handler")?;

    println!("📌 Consuming from: {}", consumer.queue_url());
    println!("🔄 Polling for messages... (Press Ctrl+C to stop)\n");

    let mut message_count = 0;

    // A long poll in flight finishes before the flag is seen
    while running.load(Ordering::SeqCst) {
        match consumer.poll_once().await {
            Ok(summary) if summary.received == 0 => {
                print!(".");
                io::stdout().flush().ok();
            }
            Ok(summary) => {
                message_count += summary.received;
                println!(
                    "   ✓ Deleted {} of {} ({} failed, {} received so far)\n",
                    summary.deleted, summary.received, summary.failed, message_count
                );
            }
            Err(e) => {
                eprintln!("❌ Error consuming messages: {e:#}");
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    println!("\n👋 Stopped after {message_count} messages");
    Ok(())
}
