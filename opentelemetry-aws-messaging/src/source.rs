//! Choosing the trace identity for an outbound message.
//!
//! The chain is, first match wins:
//!
//! 1. an explicit `traceparent` handed over by a synchronous upstream caller,
//! 2. the span context of the caller's active span,
//! 3. a freshly generated identifier.
//!
//! The active span is passed in by the caller rather than looked up from
//! ambient state, so resolution is a pure function of its inputs.

use std::fmt;

use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use tracing::{debug, warn};

use crate::traceparent::TraceIdentifier;

/// Which step of the chain produced the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    Explicit,
    ActiveSpan,
    Generated,
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceOrigin::Explicit => "explicit",
            SourceOrigin::ActiveSpan => "active_span",
            SourceOrigin::Generated => "generated",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextSource<'a> {
    explicit: Option<&'a str>,
    active: Option<SpanContext>,
}

impl<'a> ContextSource<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upstream-supplied `traceparent` text. Malformed values are skipped.
    pub fn with_explicit(mut self, traceparent: Option<&'a str>) -> Self {
        self.explicit = traceparent;
        self
    }

    pub fn with_active_span(mut self, span_context: Option<SpanContext>) -> Self {
        self.active = span_context;
        self
    }

    /// Uses the span carried by an OpenTelemetry context, if it has one.
    pub fn with_context(self, cx: &Context) -> Self {
        let span_context = cx.has_active_span().then(|| cx.span().span_context().clone());
        self.with_active_span(span_context)
    }

    pub fn resolve(&self) -> TraceIdentifier {
        self.resolve_with_origin().0
    }

    /// Never fails; the last step always produces an identifier.
    pub fn resolve_with_origin(&self) -> (TraceIdentifier, SourceOrigin) {
        let (identifier, origin) = self
            .explicit_identifier()
            .map(|id| (id, SourceOrigin::Explicit))
            .or_else(|| {
                self.active
                    .as_ref()
                    .and_then(TraceIdentifier::from_span_context)
                    .map(|id| (id, SourceOrigin::ActiveSpan))
            })
            .unwrap_or_else(|| (TraceIdentifier::generate(), SourceOrigin::Generated));

        debug!(trace_id = %identifier.trace_id_hex(), %origin, "resolved outbound trace context");
        (identifier, origin)
    }

    fn explicit_identifier(&self) -> Option<TraceIdentifier> {
        let raw = self.explicit?;
        match TraceIdentifier::parse(raw) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(value = raw, error = %e, "ignoring malformed explicit traceparent");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPSTREAM: &str = "00-68dde6a91b7146f84c4bc23f54f17b0f-50d362e330737a0f-01";
    const ACTIVE: &str = "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01";

    fn active_span() -> SpanContext {
        TraceIdentifier::parse(ACTIVE).unwrap().to_span_context()
    }

    #[test]
    fn test_explicit_override_wins() {
        let (id, origin) = ContextSource::new()
            .with_explicit(Some(UPSTREAM))
            .with_active_span(Some(active_span()))
            .resolve_with_origin();

        assert_eq!(origin, SourceOrigin::Explicit);
        assert_eq!(id.to_string(), UPSTREAM);
    }

    #[test]
    fn test_malformed_explicit_falls_through_to_active_span() {
        let (id, origin) = ContextSource::new()
            .with_explicit(Some("00-abc123-def456-01"))
            .with_active_span(Some(active_span()))
            .resolve_with_origin();

        assert_eq!(origin, SourceOrigin::ActiveSpan);
        assert_eq!(id.to_string(), ACTIVE);
    }

    #[test]
    fn test_invalid_active_span_is_ignored() {
        let (_, origin) = ContextSource::new()
            .with_active_span(Some(SpanContext::empty_context()))
            .resolve_with_origin();

        assert_eq!(origin, SourceOrigin::Generated);
    }

    #[test]
    fn test_generates_when_nothing_is_available() {
        let (id, origin) = ContextSource::new().resolve_with_origin();

        assert_eq!(origin, SourceOrigin::Generated);
        assert!(id.is_sampled());
        assert!(!id.is_zero());
    }

    #[test]
    fn test_with_context_reads_remote_span() {
        let cx = TraceIdentifier::parse(ACTIVE).unwrap().to_context();
        let id = ContextSource::new().with_context(&cx).resolve();
        assert_eq!(id.to_string(), ACTIVE);

        let (_, origin) = ContextSource::new()
            .with_context(&Context::new())
            .resolve_with_origin();
        assert_eq!(origin, SourceOrigin::Generated);
    }
}
