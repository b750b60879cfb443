//! Publishing to SNS with both trace carriers attached.

use std::collections::HashMap;

use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::types::MessageAttributeValue;
use aws_sdk_sns::Client;
use tracing::debug;

use crate::attributes::MessageAttributes;
use crate::error::PublishError;
use crate::propagation::{OutboundEnvelope, Publish};

/// [`Publish`] implementation over an SNS client.
///
/// The client is built once by the caller and shared across publishes.
///
/// ```ignore
/// let publisher = SnsPublisher::new(aws_sdk_sns::Client::new(&config));
/// let identifier = ContextSource::new().with_context(&cx).resolve();
/// let envelope = Propagator::default().attach_json(&order, &identifier)?;
/// let message_id = publisher.publish(&topic_arn, envelope).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SnsPublisher {
    client: Client,
    subject: Option<String>,
}

impl SnsPublisher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl Publish for SnsPublisher {
    async fn publish(
        &self,
        destination: &str,
        envelope: OutboundEnvelope,
    ) -> Result<String, PublishError> {
        let (payload, attributes) = envelope.into_parts();

        let response = self
            .client
            .publish()
            .topic_arn(destination)
            .message(payload)
            .set_subject(self.subject.clone())
            .set_message_attributes(Some(to_sns_attributes(&attributes)?))
            .send()
            .await
            .map_err(|e| PublishError::Transport {
                destination: destination.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let message_id = response
            .message_id()
            .ok_or_else(|| PublishError::MissingMessageId(destination.to_string()))?;
        debug!(topic_arn = destination, message_id, "published to SNS");
        Ok(message_id.to_string())
    }
}

/// Converts attributes into the SNS SDK representation.
pub fn to_sns_attributes(
    attributes: &MessageAttributes,
) -> Result<HashMap<String, MessageAttributeValue>, PublishError> {
    attributes
        .iter()
        .map(|(name, attribute)| {
            let value = MessageAttributeValue::builder()
                .data_type(&attribute.data_type)
                .set_string_value(attribute.string_value.clone())
                .build()
                .map_err(|e| PublishError::Attribute {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
            Ok((name.to_string(), value))
        })
        .collect()
}
