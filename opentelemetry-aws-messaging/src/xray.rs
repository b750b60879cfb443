//! The SQS `AWSTraceHeader` system attribute.
//!
//! The header uses the X-Ray format
//! `Root=1-<8 hex epoch>-<24 hex unique>;Parent=<16 hex>;Sampled=<0|1>`, which
//! carries the same 16-byte trace id and 8-byte parent id as `traceparent`.

use crate::error::TraceContextError;
use crate::traceparent::TraceIdentifier;

pub const AWS_TRACE_HEADER: &str = "AWSTraceHeader";

const ROOT_KEY: &str = "Root";
const PARENT_KEY: &str = "Parent";
const SAMPLED_KEY: &str = "Sampled";
const ROOT_VERSION: &str = "1";

/// Derives a [`TraceIdentifier`] from an X-Ray trace header.
///
/// `Sampled` other than `1` (including `?` and a missing key) yields an
/// unsampled identifier.
pub fn parse(header: &str) -> Result<TraceIdentifier, TraceContextError> {
    let mut root = None;
    let mut parent = None;
    let mut sampled = false;

    for pair in header.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key.trim() {
            ROOT_KEY => root = Some(value.trim()),
            PARENT_KEY => parent = Some(value.trim()),
            SAMPLED_KEY => sampled = value.trim() == "1",
            _ => {}
        }
    }

    let root = root.ok_or(TraceContextError::MalformedHeader("missing Root"))?;
    let parent = parent.ok_or(TraceContextError::MalformedHeader("missing Parent"))?;

    let mut segments = root.splitn(3, '-');
    let (Some(ROOT_VERSION), Some(epoch), Some(unique)) =
        (segments.next(), segments.next(), segments.next())
    else {
        return Err(TraceContextError::MalformedHeader("Root is not `1-<epoch>-<id>`"));
    };
    if epoch.len() != 8 || unique.len() != 24 {
        return Err(TraceContextError::MalformedHeader("Root has wrong segment lengths"));
    }

    let flags = if sampled { "01" } else { "00" };
    TraceIdentifier::parse(&format!(
        "00-{}{}-{}-{flags}",
        epoch.to_ascii_lowercase(),
        unique.to_ascii_lowercase(),
        parent.to_ascii_lowercase()
    ))
}

/// Renders an identifier as an X-Ray trace header.
pub fn to_header(identifier: &TraceIdentifier) -> String {
    let trace_id = identifier.trace_id_hex();
    let (epoch, unique) = trace_id.split_at(8);
    format!(
        "{ROOT_KEY}=1-{epoch}-{unique};{PARENT_KEY}={};{SAMPLED_KEY}={}",
        identifier.span_id_hex(),
        u8::from(identifier.is_sampled())
    )
}
