//! Recovering the business payload from a delivered body.
//!
//! When SNS delivers to SQS without raw message delivery, the SQS body is a
//! notification document:
//!
//! ```json
//! {
//!   "Type": "Notification",
//!   "MessageId": "…",
//!   "TopicArn": "arn:aws:sns:…",
//!   "Message": "{\"x\":1}",
//!   "MessageAttributes": { "traceparent": { "Type": "String", "Value": "00-…" } }
//! }
//! ```
//!
//! The published message sits in `Message` as a JSON string, and the
//! published attributes move into the envelope. Bodies that do not have this
//! shape are taken as the payload itself.

use serde_json::Value;
use tracing::warn;

use crate::attributes::MessageAttributes;
use crate::error::RecordError;

/// Field names that identify a notification envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeShape {
    pub type_field: String,
    pub notification_type: String,
    pub message_field: String,
    pub attributes_field: String,
}

impl Default for EnvelopeShape {
    fn default() -> Self {
        Self {
            type_field: "Type".to_string(),
            notification_type: "Notification".to_string(),
            message_field: "Message".to_string(),
            attributes_field: "MessageAttributes".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    pub payload: Value,
    /// Attributes found inside the envelope; `None` for bodies delivered raw.
    pub envelope_attributes: Option<MessageAttributes>,
}

impl Unwrapped {
    pub fn was_wrapped(&self) -> bool {
        self.envelope_attributes.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Unwrapper {
    shape: EnvelopeShape,
}

impl Unwrapper {
    pub fn new(shape: EnvelopeShape) -> Self {
        Self { shape }
    }

    /// Fails with [`RecordError::MalformedPayload`] when the body is not JSON,
    /// or when it is an envelope whose inner message is not JSON.
    pub fn unwrap_body(&self, raw_body: &str) -> Result<Unwrapped, RecordError> {
        let value: Value = serde_json::from_str(raw_body)
            .map_err(|e| RecordError::MalformedPayload(format!("body is not valid JSON: {e}")))?;

        let Some(message) = self.notification_message(&value) else {
            return Ok(Unwrapped {
                payload: value,
                envelope_attributes: None,
            });
        };

        let payload = serde_json::from_str(message).map_err(|e| {
            RecordError::MalformedPayload(format!("notification message is not valid JSON: {e}"))
        })?;

        Ok(Unwrapped {
            payload,
            envelope_attributes: Some(self.envelope_attributes(&value)),
        })
    }

    fn notification_message<'v>(&self, value: &'v Value) -> Option<&'v str> {
        let kind = value.get(self.shape.type_field.as_str())?.as_str()?;
        if kind != self.shape.notification_type {
            return None;
        }
        value.get(self.shape.message_field.as_str())?.as_str()
    }

    fn envelope_attributes(&self, value: &Value) -> MessageAttributes {
        let Some(raw) = value.get(self.shape.attributes_field.as_str()) else {
            return MessageAttributes::new();
        };
        serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring unreadable notification attributes");
            MessageAttributes::new()
        })
    }
}
