//! In-memory stand-in for an SNS topic feeding an SQS queue.
//!
//! Models the two delivery paths a consumer has to cope with:
//!
//! - [`DeliveryMode::Raw`]: the published body and attributes arrive as-is,
//!   like an SNS subscription with raw message delivery enabled.
//! - [`DeliveryMode::Notification`]: the body is wrapped in an SNS
//!   notification document and the attributes travel inside it, like a
//!   subscription without raw message delivery.
//!
//! On either path the relay can damage the primary carrier the way a fan-out
//! hop does when it re-publishes: overwrite it with its own identifier, or
//! drop it.

use std::sync::{Mutex, PoisonError};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::attributes::MessageAttributes;
use crate::error::PublishError;
use crate::propagation::{CarrierKeys, OutboundEnvelope, Publish};
use crate::record::InboundRecord;
use crate::traceparent::TraceIdentifier;
use crate::xray;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Raw,
    Notification,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayBehavior {
    pub mode: DeliveryMode,
    /// Replace the primary carrier with an unrelated identifier.
    pub restamp_primary: bool,
    /// Remove the primary carrier.
    pub drop_primary: bool,
    /// Copy the published primary carrier into the transport trace header
    /// (before any restamping), as X-Ray active tracing does.
    pub stamp_transport_header: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryRelay {
    keys: CarrierKeys,
    behavior: RelayBehavior,
    queue: Mutex<Vec<InboundRecord>>,
}

impl InMemoryRelay {
    pub fn new(keys: CarrierKeys, behavior: RelayBehavior) -> Self {
        Self {
            keys,
            behavior,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Turns a published envelope into the record a subscriber would see.
    pub fn relay(&self, destination: &str, envelope: OutboundEnvelope) -> InboundRecord {
        let message_id = message_id();
        let (payload, mut attributes) = envelope.into_parts();

        let transport_header = self
            .behavior
            .stamp_transport_header
            .then(|| attributes.get_str(self.keys.primary()))
            .flatten()
            .and_then(|raw| TraceIdentifier::parse(raw).ok())
            .map(|id| xray::to_header(&id));

        if self.behavior.drop_primary {
            attributes.remove(self.keys.primary());
        } else if self.behavior.restamp_primary {
            let own = TraceIdentifier::generate();
            debug!(traceparent = %own, "relay restamped primary carrier");
            attributes.insert_string(self.keys.primary(), own.to_string());
        }

        let record = match self.behavior.mode {
            DeliveryMode::Raw => {
                InboundRecord::new(&message_id, payload).with_attributes(attributes)
            }
            DeliveryMode::Notification => InboundRecord::new(
                &message_id,
                notification(&message_id, destination, &payload, &attributes).to_string(),
            ),
        };

        match transport_header {
            Some(header) => record.with_transport_header(header),
            None => record,
        }
    }

    /// Removes and returns every queued record, oldest first.
    pub fn drain(&self) -> Vec<InboundRecord> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Publish for InMemoryRelay {
    async fn publish(
        &self,
        destination: &str,
        envelope: OutboundEnvelope,
    ) -> Result<String, PublishError> {
        let record = self.relay(destination, envelope);
        let message_id = record.message_id.clone();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(message_id)
    }
}

fn notification(
    message_id: &str,
    topic_arn: &str,
    message: &str,
    attributes: &MessageAttributes,
) -> Value {
    let attributes: Map<String, Value> = attributes
        .iter()
        .map(|(name, attribute)| {
            (
                name.to_string(),
                json!({ "Type": attribute.data_type, "Value": attribute.string_value }),
            )
        })
        .collect();

    json!({
        "Type": "Notification",
        "MessageId": message_id,
        "TopicArn": topic_arn,
        "Message": message,
        "Timestamp": chrono::Utc::now().to_rfc3339(),
        "MessageAttributes": attributes,
    })
}

/// A UUID-shaped random id, like the ones SNS and SQS hand out.
fn message_id() -> String {
    let hex = format!("{:032x}", rand::random::<u128>());
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}
