//! Redundant trace context carriers on outbound messages.
//!
//! Every outbound message carries the serialized identifier twice: once in
//! the conventional `traceparent` attribute, and once in a backup attribute
//! that relays do not know about. SNS fan-out paths may regenerate the
//! conventional slot when they re-publish; the backup slot survives and lets
//! the consumer restore the original trace. Both slots are always written,
//! even on paths where the relay is known to pass attributes through.

use std::future::Future;

use opentelemetry::propagation::Injector;
use serde::Serialize;
use tracing::debug;

use crate::attributes::MessageAttributes;
use crate::error::{ConfigError, PublishError};
use crate::traceparent::TraceIdentifier;

pub const DEFAULT_PRIMARY_KEY: &str = "traceparent";
pub const DEFAULT_BACKUP_KEY: &str = "x-origin-traceparent";

/// Attribute names of the two carrier slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierKeys {
    primary: String,
    backup: String,
}

impl CarrierKeys {
    pub fn new(primary: impl Into<String>, backup: impl Into<String>) -> Result<Self, ConfigError> {
        let primary = primary.into();
        let backup = backup.into();
        if primary.is_empty() || backup.is_empty() {
            return Err(ConfigError::EmptyCarrierKey);
        }
        if primary == backup {
            return Err(ConfigError::SameCarrierKeys(primary));
        }
        Ok(Self { primary, backup })
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn backup(&self) -> &str {
        &self.backup
    }
}

impl Default for CarrierKeys {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_KEY.to_string(),
            backup: DEFAULT_BACKUP_KEY.to_string(),
        }
    }
}

/// A serialized payload plus the attributes to publish it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    payload: String,
    attributes: MessageAttributes,
}

impl OutboundEnvelope {
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn attributes(&self) -> &MessageAttributes {
        &self.attributes
    }

    pub fn into_parts(self) -> (String, MessageAttributes) {
        (self.payload, self.attributes)
    }
}

/// Writes a [`TraceIdentifier`] into both carrier slots.
#[derive(Debug, Clone, Default)]
pub struct Propagator {
    keys: CarrierKeys,
}

impl Propagator {
    pub fn new(keys: CarrierKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &CarrierKeys {
        &self.keys
    }

    pub fn attach(
        &self,
        payload: impl Into<String>,
        identifier: &TraceIdentifier,
    ) -> OutboundEnvelope {
        self.attach_with(payload, identifier, MessageAttributes::new())
    }

    /// Attaches the carriers next to caller-supplied business attributes.
    ///
    /// A business attribute that reuses a carrier name is replaced.
    pub fn attach_with(
        &self,
        payload: impl Into<String>,
        identifier: &TraceIdentifier,
        mut attributes: MessageAttributes,
    ) -> OutboundEnvelope {
        let traceparent = identifier.to_string();

        for key in [self.keys.primary(), self.keys.backup()] {
            if attributes.contains_key(key) {
                debug!(attribute = key, "business attribute replaced by trace carrier");
            }
        }
        attributes.set(self.keys.primary(), traceparent.clone());
        attributes.set(self.keys.backup(), traceparent);

        OutboundEnvelope {
            payload: payload.into(),
            attributes,
        }
    }

    /// Serializes `payload` as JSON and attaches the carriers.
    pub fn attach_json<T: Serialize>(
        &self,
        payload: &T,
        identifier: &TraceIdentifier,
    ) -> Result<OutboundEnvelope, serde_json::Error> {
        Ok(self.attach(serde_json::to_string(payload)?, identifier))
    }
}

/// The outbound side of a transport adapter.
pub trait Publish {
    /// Publishes `envelope` to `destination` and returns the transport's
    /// message id.
    fn publish(
        &self,
        destination: &str,
        envelope: OutboundEnvelope,
    ) -> impl Future<Output = Result<String, PublishError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-68dde6a91b7146f84c4bc23f54f17b0f-50d362e330737a0f-01";

    #[test]
    fn test_attach_fills_both_slots_with_same_value() {
        let id = TraceIdentifier::parse(SAMPLE).unwrap();
        let envelope = Propagator::default().attach(r#"{"x":1}"#, &id);

        assert_eq!(envelope.payload(), r#"{"x":1}"#);
        assert_eq!(envelope.attributes().len(), 2);
        assert_eq!(envelope.attributes().get_str(DEFAULT_PRIMARY_KEY), Some(SAMPLE));
        assert_eq!(envelope.attributes().get_str(DEFAULT_BACKUP_KEY), Some(SAMPLE));
    }

    #[test]
    fn test_attach_keeps_business_attributes() {
        let id = TraceIdentifier::parse(SAMPLE).unwrap();
        let mut business = MessageAttributes::new();
        business.insert_string("event-type", "order.created");
        business.insert_string(DEFAULT_PRIMARY_KEY, "stale");

        let envelope = Propagator::default().attach_with("{}", &id, business);

        assert_eq!(envelope.attributes().len(), 3);
        assert_eq!(envelope.attributes().get_str("event-type"), Some("order.created"));
        assert_eq!(envelope.attributes().get_str(DEFAULT_PRIMARY_KEY), Some(SAMPLE));
    }

    #[test]
    fn test_attach_uses_configured_keys() {
        let id = TraceIdentifier::parse(SAMPLE).unwrap();
        let keys = CarrierKeys::new("traceparent", "_trace_backup").unwrap();
        let envelope = Propagator::new(keys).attach("{}", &id);

        assert_eq!(envelope.attributes().get_str("_trace_backup"), Some(SAMPLE));
        assert_eq!(envelope.attributes().get_str(DEFAULT_BACKUP_KEY), None);
    }

    #[test]
    fn test_attach_json_serializes_payload() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
        }

        let id = TraceIdentifier::parse(SAMPLE).unwrap();
        let envelope = Propagator::default().attach_json(&Order { id: 7 }, &id).unwrap();

        assert_eq!(envelope.payload(), r#"{"id":7}"#);
    }

    #[test]
    fn test_carrier_keys_must_differ() {
        assert_eq!(
            CarrierKeys::new("traceparent", "traceparent"),
            Err(ConfigError::SameCarrierKeys("traceparent".to_string()))
        );
        assert_eq!(CarrierKeys::new("", "backup"), Err(ConfigError::EmptyCarrierKey));
    }
}
