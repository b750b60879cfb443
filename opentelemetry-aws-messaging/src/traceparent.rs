//! Codec for the canonical W3C `traceparent` text form.
//!
//! ```text
//! 00-68dde6a91b7146f84c4bc23f54f17b0f-50d362e330737a0f-01
//! ^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^ ^^
//! |  trace id (16 bytes)              span id (8 bytes) flags
//! version
//! ```
//!
//! Every field is lowercase hex. Only version `00` is understood; anything
//! else is rejected rather than guessed at.

use std::fmt;
use std::str::FromStr;

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;

use crate::error::TraceContextError;

pub const SUPPORTED_VERSION: u8 = 0x00;

const SAMPLED_FLAG: u8 = 0x01;

const FIELDS: [(&str, usize); 4] = [
    ("version", 2),
    ("trace-id", 32),
    ("parent-id", 16),
    ("trace-flags", 2),
];

/// An immutable, structurally valid trace context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceIdentifier {
    version: u8,
    trace_id: u128,
    span_id: u64,
    flags: u8,
}

impl TraceIdentifier {
    pub fn new(trace_id: u128, span_id: u64, sampled: bool) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            trace_id,
            span_id,
            flags: if sampled { SAMPLED_FLAG } else { 0 },
        }
    }

    /// Parses the canonical text form.
    ///
    /// The text must match exactly; surrounding whitespace is malformed.
    /// Flags are reduced to the sampled bit, which is the only bit this
    /// codec serializes back.
    pub fn parse(text: &str) -> Result<Self, TraceContextError> {
        let fields: Vec<&str> = text.split('-').collect();
        if fields.len() != FIELDS.len() {
            return Err(TraceContextError::FieldCount(fields.len()));
        }

        for (value, (field, expected)) in fields.iter().zip(FIELDS) {
            if value.len() != expected {
                return Err(TraceContextError::FieldLength {
                    field,
                    expected,
                    actual: value.len(),
                });
            }
            if !value.bytes().all(is_lower_hex) {
                return Err(TraceContextError::NotLowerHex { field });
            }
        }

        let version = u8::from_str_radix(fields[0], 16)
            .map_err(|_| TraceContextError::NotLowerHex { field: "version" })?;
        if version != SUPPORTED_VERSION {
            return Err(TraceContextError::UnsupportedVersion(fields[0].to_string()));
        }

        let trace_id = u128::from_str_radix(fields[1], 16)
            .map_err(|_| TraceContextError::NotLowerHex { field: "trace-id" })?;
        let span_id = u64::from_str_radix(fields[2], 16)
            .map_err(|_| TraceContextError::NotLowerHex { field: "parent-id" })?;
        let flags = u8::from_str_radix(fields[3], 16)
            .map_err(|_| TraceContextError::NotLowerHex { field: "trace-flags" })?;

        Ok(Self {
            version,
            trace_id,
            span_id,
            flags: flags & SAMPLED_FLAG,
        })
    }

    /// Random identifier with the sampled bit set.
    ///
    /// Last-resort fallback when no upstream context exists. Ids come from
    /// [`rand::random`] and are only meant for correlation.
    pub fn generate() -> Self {
        Self::new(non_zero(rand::random::<u128>), non_zero(rand::random::<u64>), true)
    }

    /// Builds an identifier from an OpenTelemetry span context.
    ///
    /// Returns `None` for the invalid (all-zero) span context that
    /// OpenTelemetry hands out when no span is active.
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        if !span_context.is_valid() {
            return None;
        }
        Some(Self::new(
            u128::from_be_bytes(span_context.trace_id().to_bytes()),
            u64::from_be_bytes(span_context.span_id().to_bytes()),
            span_context.is_sampled(),
        ))
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn trace_id(&self) -> TraceId {
        TraceId::from_bytes(self.trace_id.to_be_bytes())
    }

    pub fn span_id(&self) -> SpanId {
        SpanId::from_bytes(self.span_id.to_be_bytes())
    }

    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & SAMPLED_FLAG == SAMPLED_FLAG
    }

    /// True when the trace id or span id is all zeroes.
    ///
    /// Such an identifier is syntactically valid but carries no identity.
    pub fn is_zero(&self) -> bool {
        self.trace_id == 0 || self.span_id == 0
    }

    /// Converts to a remote OpenTelemetry span context.
    pub fn to_span_context(&self) -> SpanContext {
        let flags = if self.is_sampled() {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        SpanContext::new(
            self.trace_id(),
            self.span_id(),
            flags,
            true,
            TraceState::default(),
        )
    }

    /// An OpenTelemetry context whose parent is this identifier.
    pub fn to_context(&self) -> Context {
        Context::new().with_remote_span_context(self.to_span_context())
    }
}

impl fmt::Display for TraceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = if self.is_sampled() { "01" } else { "00" };
        write!(
            f,
            "{:02x}-{:032x}-{:016x}-{flags}",
            self.version, self.trace_id, self.span_id
        )
    }
}

impl FromStr for TraceIdentifier {
    type Err = TraceContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_lower_hex(byte: u8) -> bool {
    byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte)
}

fn non_zero<T: Default + PartialEq>(mut next: impl FnMut() -> T) -> T {
    loop {
        let value = next();
        if value != T::default() {
            return value;
        }
    }
}
