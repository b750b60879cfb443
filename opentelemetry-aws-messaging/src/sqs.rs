//! Receiving batches from SQS and acknowledging the processed records.
//!
//! Only records that succeeded are deleted. Failed records stay on the queue
//! and come back once their visibility timeout expires.

use std::collections::HashMap;

use aws_sdk_sqs::error::{BuildError, DisplayErrorContext};
use aws_sdk_sqs::types::{
    BatchResultErrorEntry, DeleteMessageBatchRequestEntry, Message, MessageAttributeValue,
    MessageSystemAttributeName,
};
use aws_sdk_sqs::Client;
use tracing::{debug, warn};

use crate::attributes::{MessageAttribute, MessageAttributes};
use crate::batch::BatchOutcome;
use crate::error::ReceiveError;
use crate::record::InboundRecord;

const DELETE_BATCH_LIMIT: usize = 10;

/// Receipt handles of a received batch, keyed by message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipts(HashMap<String, String>);

impl Receipts {
    pub fn get(&self, message_id: &str) -> Option<&str> {
        self.0.get(message_id).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReceivedBatch {
    pub records: Vec<InboundRecord>,
    pub receipts: Receipts,
}

impl ReceivedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SqsBatchSource {
    client: Client,
    queue_url: String,
    max_messages: i32,
    wait_time_seconds: i32,
}

impl SqsBatchSource {
    /// Long-polls for up to 10 messages, 20 seconds at a time.
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            max_messages: 10,
            wait_time_seconds: 20,
        }
    }

    pub fn with_max_messages(mut self, max_messages: i32) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Receives one batch, asking for every message attribute and the
    /// `AWSTraceHeader` system attribute.
    pub async fn receive(&self) -> Result<ReceivedBatch, ReceiveError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.max_messages)
            .wait_time_seconds(self.wait_time_seconds)
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::AwsTraceHeader)
            .send()
            .await
            .map_err(|e| ReceiveError::Receive {
                queue_url: self.queue_url.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let mut batch = ReceivedBatch::default();
        for message in response.messages.unwrap_or_default() {
            let Some(record) = inbound_record(&message) else {
                warn!(queue_url = %self.queue_url, "skipping message without id");
                continue;
            };
            if let Some(handle) = message.receipt_handle() {
                batch
                    .receipts
                    .0
                    .insert(record.message_id.clone(), handle.to_string());
            }
            batch.records.push(record);
        }

        debug!(queue_url = %self.queue_url, records = batch.records.len(), "received batch");
        Ok(batch)
    }

    /// Deletes every record the outcome marks as successful, in chunks of
    /// ten through `DeleteMessageBatch`.
    ///
    /// A failed delete never stops the remaining ones; each failure is
    /// logged and reported in the returned [`Acknowledgement`].
    pub async fn acknowledge(
        &self,
        receipts: &Receipts,
        outcome: &BatchOutcome,
    ) -> Acknowledgement {
        let pending: Vec<(&str, &str)> = outcome
            .succeeded_identities()
            .into_iter()
            .filter_map(|message_id| match receipts.get(message_id) {
                Some(handle) => Some((message_id, handle)),
                None => {
                    warn!(message_id, "no receipt handle, cannot delete");
                    None
                }
            })
            .collect();

        let mut acknowledgement = Acknowledgement::default();
        for chunk in pending.chunks(DELETE_BATCH_LIMIT) {
            let chunk_result = match delete_entries(chunk) {
                Ok(entries) => self
                    .client
                    .delete_message_batch()
                    .queue_url(&self.queue_url)
                    .set_entries(Some(entries))
                    .send()
                    .await
                    .map(|response| tally(chunk, response.failed()))
                    .map_err(|e| DisplayErrorContext(&e).to_string()),
                Err(e) => Err(e.to_string()),
            };
            let chunk_acknowledgement = chunk_result.unwrap_or_else(|message| Acknowledgement {
                deleted: 0,
                failures: chunk
                    .iter()
                    .map(|(message_id, _)| ReceiveError::Delete {
                        message_id: message_id.to_string(),
                        message: message.clone(),
                    })
                    .collect(),
            });
            acknowledgement.merge(chunk_acknowledgement);
        }

        for failure in &acknowledgement.failures {
            warn!(queue_url = %self.queue_url, error = %failure, "message left on the queue");
        }
        acknowledgement
    }
}

/// Result of deleting a batch's successful records.
#[derive(Debug, Default)]
pub struct Acknowledgement {
    pub deleted: usize,
    /// One [`ReceiveError::Delete`] per message that could not be deleted.
    pub failures: Vec<ReceiveError>,
}

impl Acknowledgement {
    fn merge(&mut self, other: Acknowledgement) {
        self.deleted += other.deleted;
        self.failures.extend(other.failures);
    }
}

/// Entry ids are positions within `chunk`, unique per request.
fn delete_entries(
    chunk: &[(&str, &str)],
) -> Result<Vec<DeleteMessageBatchRequestEntry>, BuildError> {
    chunk
        .iter()
        .enumerate()
        .map(|(index, (_, handle))| {
            DeleteMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(*handle)
                .build()
        })
        .collect()
}

/// Maps the `Failed` entries of a `DeleteMessageBatch` response back to
/// the message ids of `chunk`.
fn tally(chunk: &[(&str, &str)], failed: &[BatchResultErrorEntry]) -> Acknowledgement {
    let failures: Vec<ReceiveError> = failed
        .iter()
        .filter_map(|entry| {
            let (message_id, _) = chunk.get(entry.id().parse::<usize>().ok()?)?;
            Some(ReceiveError::Delete {
                message_id: message_id.to_string(),
                message: match entry.message() {
                    Some(message) => format!("{}: {message}", entry.code()),
                    None => entry.code().to_string(),
                },
            })
        })
        .collect();

    Acknowledgement {
        deleted: chunk.len().saturating_sub(failures.len()),
        failures,
    }
}

/// Converts an SDK message into an [`InboundRecord`].
///
/// Returns `None` when the message has no id, since it could not be
/// reported for redelivery.
pub fn inbound_record(message: &Message) -> Option<InboundRecord> {
    let mut record = InboundRecord::new(message.message_id()?, message.body().unwrap_or_default());
    if let Some(attributes) = message.message_attributes() {
        record = record.with_attributes(from_sqs_attributes(attributes));
    }
    if let Some(header) = message
        .attributes()
        .and_then(|system| system.get(&MessageSystemAttributeName::AwsTraceHeader))
    {
        record = record.with_transport_header(header);
    }
    Some(record)
}

pub fn from_sqs_attributes(
    attributes: &HashMap<String, MessageAttributeValue>,
) -> MessageAttributes {
    attributes
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                MessageAttribute {
                    data_type: value.data_type().to_string(),
                    string_value: value.string_value().map(str::to_string),
                },
            )
        })
        .collect()
}
