//! Redundant W3C trace context propagation across AWS SNS and SQS.
//!
//! Relays between a publisher and its consumers may rewrite the standard
//! `traceparent` message attribute with their own identifier. This crate
//! writes the publisher's identifier into two attributes, the primary
//! `traceparent` and a backup `x-origin-traceparent` that relays leave
//! alone, and on the consumer side recovers the original identity from
//! whichever of them survived.
//!
//! # Features
//!
//! - `sns` - Publishing through the SNS SDK (enabled by default)
//! - `sqs` - Receiving and acknowledging through the SQS SDK (enabled by default)
//!
//! # Example
//!
//! ## Publishing with both carriers
//!
//! ```ignore
//! use opentelemetry_aws_messaging::{ContextSource, Propagator, Publish, SnsPublisher};
//!
//! let identifier = ContextSource::new().with_context(&cx).resolve();
//! let envelope = Propagator::default().attach_json(&order, &identifier)?;
//! SnsPublisher::new(sns_client).publish(&topic_arn, envelope).await?;
//! ```
//!
//! ## Processing a batch
//!
//! ```ignore
//! use opentelemetry_aws_messaging::{BatchProcessor, Delivery};
//!
//! let outcome = BatchProcessor::default()
//!     .process(records, |delivery: Delivery<Order>| async move {
//!         tracing::info!(trace_id = %delivery.context.identifier.trace_id_hex(), "order");
//!         Ok(())
//!     })
//!     .await;
//! // Serializes to {"batchItemFailures":[...]}
//! let response = serde_json::to_value(&outcome)?;
//! ```

pub mod attributes;
pub mod batch;
pub mod envelope;
pub mod error;
pub mod propagation;
pub mod record;
pub mod recovery;
pub mod relay;
pub mod source;
pub mod traceparent;
pub mod xray;

#[cfg(feature = "sns")]
pub mod sns;

#[cfg(feature = "sqs")]
pub mod sqs;

// Re-exports for convenience
pub use attributes::{MessageAttribute, MessageAttributes};
pub use batch::{BatchConfig, BatchOutcome, BatchProcessor, Delivery, RecordStatus};
pub use envelope::{EnvelopeShape, Unwrapper};
pub use error::{
    ConfigError, HandlerFailure, PublishError, ReceiveError, RecordError, TraceContextError,
};
pub use propagation::{CarrierKeys, OutboundEnvelope, Propagator, Publish};
pub use record::{InboundRecord, SqsEvent};
pub use recovery::{ContextOrigin, RecoveredContext, Recoverer};
pub use relay::{DeliveryMode, InMemoryRelay, RelayBehavior};
pub use source::{ContextSource, SourceOrigin};
pub use traceparent::TraceIdentifier;

#[cfg(feature = "sns")]
pub use sns::SnsPublisher;

#[cfg(feature = "sqs")]
pub use sqs::{Acknowledgement, ReceivedBatch, SqsBatchSource};
