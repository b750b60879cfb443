//! Error types for trace context propagation and batch processing.

use std::time::Duration;

use thiserror::Error;

/// A carrier value that is present but does not have the canonical
/// `version-traceid-spanid-flags` shape.
///
/// Never fatal: callers treat the carrier as absent and log the problem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceContextError {
    #[error("expected 4 dash-separated fields, found {0}")]
    FieldCount(usize),

    #[error("{field} must be {expected} hex characters, found {actual}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} is not lowercase hex")]
    NotLowerHex { field: &'static str },

    #[error("unsupported traceparent version `{0}`")]
    UnsupportedVersion(String),

    #[error("malformed transport trace header: {0}")]
    MalformedHeader(&'static str),
}

/// Terminal failure of a single record inside a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The body (or the message inside a notification envelope) could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The business handler returned an error.
    #[error("{classification}: {message}")]
    Callback {
        classification: String,
        message: String,
    },

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler task was cancelled")]
    Cancelled,
}

/// Classified failure a business handler can return through [`anyhow::Error`].
///
/// The batch processor downcasts handler errors to this type to recover the
/// classification; any other error is reported as `unclassified`.
///
/// ```ignore
/// return Err(HandlerFailure::new("validation", "order id is missing").into());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerFailure {
    pub classification: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(classification: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("primary and backup carrier keys must differ, both are `{0}`")]
    SameCarrierKeys(String),

    #[error("carrier key must not be empty")]
    EmptyCarrierKey,
}

/// Failure of the outbound publish call.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to encode payload")]
    Encode(#[from] serde_json::Error),

    #[error("invalid message attribute `{name}`: {message}")]
    Attribute { name: String, message: String },

    #[error("publish to {destination} failed: {message}")]
    Transport {
        destination: String,
        message: String,
    },

    #[error("publish to {0} returned no message id")]
    MissingMessageId(String),
}

/// Failure talking to the inbound queue.
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("receive from {queue_url} failed: {message}")]
    Receive { queue_url: String, message: String },

    #[error("delete of message {message_id} failed: {message}")]
    Delete { message_id: String, message: String },
}
