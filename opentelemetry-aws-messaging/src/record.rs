//! One delivered message as handed to the consumer.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

use crate::attributes::MessageAttributes;
use crate::xray::AWS_TRACE_HEADER;

/// A delivered message, read-only once received.
///
/// Deserializes from an SQS event record:
///
/// ```json
/// {
///   "messageId": "059f36b4-87a3-44ab-83d2-661975830a7d",
///   "body": "{\"x\":1}",
///   "messageAttributes": { "traceparent": { "dataType": "String", "stringValue": "00-…" } },
///   "attributes": { "AWSTraceHeader": "Root=1-…;Parent=…;Sampled=1" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRecord {
    /// Identity reported back when the record needs redelivery.
    pub message_id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub message_attributes: MessageAttributes,
    /// The transport-level trace header, separate from the carrier attributes.
    #[serde(default, rename = "attributes", deserialize_with = "trace_header_from_attributes")]
    pub transport_header: Option<String>,
}

impl InboundRecord {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            message_attributes: MessageAttributes::new(),
            transport_header: None,
        }
    }

    pub fn with_attributes(mut self, attributes: MessageAttributes) -> Self {
        self.message_attributes = attributes;
        self
    }

    pub fn with_transport_header(mut self, header: impl Into<String>) -> Self {
        self.transport_header = Some(header.into());
        self
    }
}

fn trace_header_from_attributes<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let attributes = Option::<HashMap<String, String>>::deserialize(deserializer)?;
    Ok(attributes.and_then(|mut attributes| attributes.remove(AWS_TRACE_HEADER)))
}

/// The `Records` array of an SQS event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SqsEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<InboundRecord>,
}
