//! Producer and consumer halves shared by the binaries.

use anyhow::{Context, Result};
use opentelemetry_aws_messaging::{
    BatchProcessor, ContextSource, Delivery, Propagator, Publish, Recoverer, SnsPublisher,
    SqsBatchSource, Unwrapper,
};
use tracing::{info, instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::AppConfig;
use crate::Message;

/// Publishes [`Message`]s to SNS with both trace carriers attached.
pub struct Producer {
    publisher: SnsPublisher,
    propagator: Propagator,
    topic_arn: String,
    upstream: Option<String>,
}

impl Producer {
    pub fn new(client: aws_sdk_sns::Client, config: &AppConfig) -> Result<Self> {
        Ok(Self {
            publisher: SnsPublisher::new(client),
            propagator: Propagator::new(config.carrier_keys.clone()),
            topic_arn: config.topic_arn()?.to_string(),
            upstream: config.traceparent.clone(),
        })
    }

    pub fn topic_arn(&self) -> &str {
        &self.topic_arn
    }

    /// Returns the SNS message id.
    #[instrument(name = "sns.publish", skip_all, fields(message.id = message.id))]
    pub async fn publish(&self, message: &Message) -> Result<String> {
        let (identifier, origin) = ContextSource::new()
            .with_explicit(self.upstream.as_deref())
            .with_context(&Span::current().context())
            .resolve_with_origin();

        let envelope = self
            .propagator
            .attach_json(message, &identifier)
            .context("Failed to serialize message")?;
        let message_id = self
            .publisher
            .publish(&self.topic_arn, envelope)
            .await
            .context("Failed to publish message to SNS")?;

        info!(%message_id, traceparent = %identifier, %origin, "published message");
        Ok(message_id)
    }
}

/// Counts for one receive, process and delete round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub failed: usize,
    pub deleted: usize,
}

/// Receives SQS batches, runs each record inside its recovered trace and
/// deletes the records that succeeded.
pub struct Consumer {
    source: SqsBatchSource,
    processor: BatchProcessor,
}

impl Consumer {
    pub fn new(client: aws_sdk_sqs::Client, config: &AppConfig) -> Result<Self> {
        Ok(Self {
            source: SqsBatchSource::new(client, config.queue_url()?),
            processor: BatchProcessor::new(
                Unwrapper::default(),
                Recoverer::new(config.carrier_keys.clone()),
                config.batch.clone(),
            ),
        })
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.source = self.source.with_wait_time_seconds(seconds);
        self
    }

    pub fn queue_url(&self) -> &str {
        self.source.queue_url()
    }

    pub async fn poll_once(&self) -> Result<PollSummary> {
        let batch = self
            .source
            .receive()
            .await
            .context("Failed to receive messages from SQS")?;
        if batch.is_empty() {
            return Ok(PollSummary::default());
        }

        let received = batch.records.len();
        let outcome = self.processor.process(batch.records, handle_message).await;
        for message_id in outcome.failed_identities() {
            eprintln!("❌ {message_id} failed, left on the queue for redelivery");
        }

        let acknowledgement = self.source.acknowledge(&batch.receipts, &outcome).await;
        for failure in &acknowledgement.failures {
            eprintln!("⚠️  {failure}, will be redelivered");
        }

        Ok(PollSummary {
            received,
            failed: outcome.failed_identities().len(),
            deleted: acknowledgement.deleted,
        })
    }
}

async fn handle_message(delivery: Delivery<Message>) -> Result<()> {
    let message = &delivery.payload;
    let context = &delivery.context;
    println!("📨 Received: {}", message.content);
    println!(
        "   ID: {}, Timestamp: {}, Trace: {} ({})",
        message.id,
        message.timestamp,
        context.identifier.trace_id_hex(),
        context.origin
    );
    if let Some(divergence) = &context.divergence {
        println!(
            "   ↪ primary carrier was rewritten in transit to {}",
            divergence.primary
        );
    }
    info!(message.id = message.id, "handled message");
    Ok(())
}
