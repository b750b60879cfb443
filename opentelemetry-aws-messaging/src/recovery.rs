//! Restoring the authoritative trace identity of an inbound record.
//!
//! A record may carry up to three candidates: the backup carrier, the
//! primary carrier and the transport's own trace header. The backup carrier
//! is the one relays leave alone, so it is preferred whenever it parses; the
//! primary carrier and then the transport header are fallbacks. A record
//! with none of them recovers nothing, and the caller generates a fresh
//! identifier for its local work.
//!
//! Carrier slots are looked up in the record's own attributes first and then
//! in the attributes of a notification envelope, when there was one.

use std::fmt;

use tracing::{debug, info, warn};

use crate::attributes::MessageAttributes;
use crate::propagation::CarrierKeys;
use crate::record::InboundRecord;
use crate::traceparent::TraceIdentifier;
use crate::xray;

const PREVIEW_LIMIT: usize = 96;

/// Where the recovered identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOrigin {
    Backup,
    Primary,
    TransportHeader,
    /// Nothing was recoverable; the identifier was generated locally.
    Generated,
}

impl fmt::Display for ContextOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextOrigin::Backup => "backup",
            ContextOrigin::Primary => "primary",
            ContextOrigin::TransportHeader => "transport_header",
            ContextOrigin::Generated => "generated",
        })
    }
}

/// Both carriers parsed but disagree, which happens when a relay rewrote the
/// primary slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub primary: TraceIdentifier,
    pub backup: TraceIdentifier,
}

impl Divergence {
    /// True when the relay replaced the trace id and not just the span id.
    pub fn trace_changed(&self) -> bool {
        self.primary.trace_id() != self.backup.trace_id()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredContext {
    pub identifier: TraceIdentifier,
    pub origin: ContextOrigin,
    pub divergence: Option<Divergence>,
}

impl RecoveredContext {
    /// A fresh identifier for a record whose context could not be recovered.
    pub fn generated() -> Self {
        Self {
            identifier: TraceIdentifier::generate(),
            origin: ContextOrigin::Generated,
            divergence: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Recoverer {
    keys: CarrierKeys,
}

impl Recoverer {
    pub fn new(keys: CarrierKeys) -> Self {
        Self { keys }
    }

    /// Selects the authoritative identifier for `record`.
    ///
    /// Returns `None` when no candidate parses. Malformed candidates are
    /// logged and skipped; this function never fails.
    pub fn recover(
        &self,
        record: &InboundRecord,
        envelope_attributes: Option<&MessageAttributes>,
    ) -> Option<RecoveredContext> {
        let sources = [Some(&record.message_attributes), envelope_attributes];
        let backup = read_slot(record, self.keys.backup(), &sources);
        let primary = read_slot(record, self.keys.primary(), &sources);

        let divergence = match (primary, backup) {
            (Some(primary), Some(backup)) if primary != backup => {
                Some(Divergence { primary, backup })
            }
            _ => None,
        };
        if let Some(divergence) = &divergence {
            info!(
                message_id = %record.message_id,
                primary = %divergence.primary,
                backup = %divergence.backup,
                trace_changed = divergence.trace_changed(),
                "trace carriers diverged in transit, keeping backup"
            );
        }

        let (identifier, origin) = backup
            .map(|id| (id, ContextOrigin::Backup))
            .or_else(|| primary.map(|id| (id, ContextOrigin::Primary)))
            .or_else(|| {
                read_transport_header(record).map(|id| (id, ContextOrigin::TransportHeader))
            })
            .or_else(|| {
                debug!(message_id = %record.message_id, "no trace context on record");
                None
            })?;

        if identifier.is_zero() {
            warn!(
                message_id = %record.message_id,
                %origin,
                traceparent = %identifier,
                "recovered trace context has an all-zero id"
            );
        }

        Some(RecoveredContext {
            identifier,
            origin,
            divergence,
        })
    }
}

fn read_slot(
    record: &InboundRecord,
    key: &str,
    sources: &[Option<&MessageAttributes>],
) -> Option<TraceIdentifier> {
    sources
        .iter()
        .flatten()
        .filter_map(|attributes| attributes.get_str(key))
        .find_map(|raw| match TraceIdentifier::parse(raw) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    message_id = %record.message_id,
                    attribute = key,
                    value = %preview(raw),
                    error = %e,
                    "malformed trace context in carrier"
                );
                None
            }
        })
}

fn read_transport_header(record: &InboundRecord) -> Option<TraceIdentifier> {
    let raw = record.transport_header.as_deref()?;
    TraceIdentifier::parse(raw)
        .or_else(|_| xray::parse(raw))
        .map_err(|e| {
            warn!(
                message_id = %record.message_id,
                value = %preview(raw),
                error = %e,
                "malformed transport trace header"
            );
        })
        .ok()
}

/// Bounds the size of a logged value without hiding its content.
fn preview(raw: &str) -> String {
    match raw.char_indices().nth(PREVIEW_LIMIT) {
        Some((cut, _)) => format!("{}… ({} bytes)", &raw[..cut], raw.len()),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::{DEFAULT_BACKUP_KEY, DEFAULT_PRIMARY_KEY};

    const ORIGINAL: &str = "00-68dde6a91b7146f84c4bc23f54f17b0f-50d362e330737a0f-01";
    const RESTAMPED: &str = "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01";
    const XRAY: &str = "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=1";

    fn record(primary: Option<&str>, backup: Option<&str>) -> InboundRecord {
        let mut attributes = MessageAttributes::new();
        if let Some(primary) = primary {
            attributes.insert_string(DEFAULT_PRIMARY_KEY, primary);
        }
        if let Some(backup) = backup {
            attributes.insert_string(DEFAULT_BACKUP_KEY, backup);
        }
        InboundRecord::new("msg-1", "{}").with_attributes(attributes)
    }

    #[test]
    fn test_primary_only() {
        let recovered = Recoverer::default()
            .recover(&record(Some(ORIGINAL), None), None)
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
        assert_eq!(recovered.origin, ContextOrigin::Primary);
        assert_eq!(recovered.divergence, None);
    }

    #[test]
    fn test_backup_wins_over_diverged_primary() {
        let recovered = Recoverer::default()
            .recover(&record(Some(RESTAMPED), Some(ORIGINAL)), None)
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
        assert_eq!(recovered.origin, ContextOrigin::Backup);
        let divergence = recovered.divergence.unwrap();
        assert_eq!(divergence.primary.to_string(), RESTAMPED);
        assert!(divergence.trace_changed());
    }

    #[test]
    fn test_matching_slots_do_not_diverge() {
        let recovered = Recoverer::default()
            .recover(&record(Some(ORIGINAL), Some(ORIGINAL)), None)
            .unwrap();

        assert_eq!(recovered.origin, ContextOrigin::Backup);
        assert_eq!(recovered.divergence, None);
    }

    #[test]
    fn test_malformed_backup_falls_back_to_primary() {
        let recovered = Recoverer::default()
            .recover(&record(Some(ORIGINAL), Some("00-abc123-def456-01")), None)
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
        assert_eq!(recovered.origin, ContextOrigin::Primary);
    }

    #[test]
    fn test_padded_backup_is_malformed() {
        let padded = format!("\t{RESTAMPED} ");
        let recovered = Recoverer::default()
            .recover(&record(Some(ORIGINAL), Some(&padded)), None)
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
        assert_eq!(recovered.origin, ContextOrigin::Primary);
        assert_eq!(recovered.divergence, None);
    }

    #[test]
    fn test_transport_header_is_last_resort() {
        let with_header = record(None, None).with_transport_header(XRAY);
        let recovered = Recoverer::default().recover(&with_header, None).unwrap();

        assert_eq!(recovered.origin, ContextOrigin::TransportHeader);
        assert_eq!(
            recovered.identifier.trace_id_hex(),
            "5759e988bd862e3fe1be46a994272793"
        );

        let with_both = record(Some(ORIGINAL), None).with_transport_header(XRAY);
        let recovered = Recoverer::default().recover(&with_both, None).unwrap();
        assert_eq!(recovered.origin, ContextOrigin::Primary);
    }

    #[test]
    fn test_transport_header_in_traceparent_form() {
        let with_header = record(None, None).with_transport_header(ORIGINAL);
        let recovered = Recoverer::default().recover(&with_header, None).unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
    }

    #[test]
    fn test_nothing_recoverable_is_absent() {
        assert_eq!(Recoverer::default().recover(&record(None, None), None), None);

        let garbage = record(Some("garbage"), Some("more-garbage")).with_transport_header("Root=;");
        assert_eq!(Recoverer::default().recover(&garbage, None), None);
    }

    #[test]
    fn test_reads_envelope_attributes() {
        let mut envelope = MessageAttributes::new();
        envelope.insert_string(DEFAULT_PRIMARY_KEY, RESTAMPED);
        envelope.insert_string(DEFAULT_BACKUP_KEY, ORIGINAL);

        let recovered = Recoverer::default()
            .recover(&record(None, None), Some(&envelope))
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
        assert_eq!(recovered.origin, ContextOrigin::Backup);
    }

    #[test]
    fn test_record_attributes_take_precedence_over_envelope() {
        let mut envelope = MessageAttributes::new();
        envelope.insert_string(DEFAULT_BACKUP_KEY, RESTAMPED);

        let recovered = Recoverer::default()
            .recover(&record(None, Some(ORIGINAL)), Some(&envelope))
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
    }

    #[test]
    fn test_all_zero_identifier_counts_as_present() {
        let zero = "00-00000000000000000000000000000000-0000000000000000-00";
        let recovered = Recoverer::default()
            .recover(&record(Some(zero), None), None)
            .unwrap();

        assert!(recovered.identifier.is_zero());
        assert_eq!(recovered.origin, ContextOrigin::Primary);
    }

    #[test]
    fn test_custom_keys() {
        let keys = CarrierKeys::new("tp", "tp-backup").unwrap();
        let mut attributes = MessageAttributes::new();
        attributes.insert_string("tp-backup", ORIGINAL);
        attributes.insert_string(DEFAULT_BACKUP_KEY, RESTAMPED);

        let recovered = Recoverer::new(keys)
            .recover(&InboundRecord::new("m", "{}").with_attributes(attributes), None)
            .unwrap();

        assert_eq!(recovered.identifier.to_string(), ORIGINAL);
    }

    #[test]
    fn test_preview_bounds_long_values() {
        assert_eq!(preview("short"), "short");

        let long = "a".repeat(500);
        let shown = preview(&long);
        assert!(shown.starts_with(&"a".repeat(PREVIEW_LIMIT)));
        assert!(shown.ends_with("(500 bytes)"));
    }

    #[test]
    fn test_generated_context() {
        let generated = RecoveredContext::generated();
        assert_eq!(generated.origin, ContextOrigin::Generated);
        assert!(!generated.identifier.is_zero());
    }
}
