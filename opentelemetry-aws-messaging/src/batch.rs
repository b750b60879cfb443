//! Processing a delivered batch record by record.
//!
//! Each record is unwrapped, its trace context recovered, and the business
//! handler run inside a `sqs.process` span parented to that context. A
//! failure of any kind (unparseable body, handler error, timeout, panic) is
//! confined to its own record: the remaining records still run, and the
//! outcome lists exactly the failed ones for redelivery.
//!
//! Handlers run on tokio tasks. With `max_concurrency == 1` (the default)
//! they run one after the other in delivery order; with more, up to that
//! many run at once and only the outcome keeps delivery order.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{info, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::envelope::Unwrapper;
use crate::error::{HandlerFailure, RecordError};
use crate::record::InboundRecord;
use crate::recovery::{RecoveredContext, Recoverer};

pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(30);

const UNCLASSIFIED: &str = "unclassified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Upper bound on a single handler invocation. `None` waits forever.
    pub record_timeout: Option<Duration>,
    /// Number of handlers allowed to run at once; `0` is treated as `1`.
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            record_timeout: Some(DEFAULT_RECORD_TIMEOUT),
            max_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Error(RecordError),
}

impl RecordStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordStatus::Success)
    }
}

/// One terminal status per input record, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    statuses: Vec<(String, RecordStatus)>,
}

impl BatchOutcome {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            statuses: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, message_id: String, status: RecordStatus) {
        self.statuses.push((message_id, status));
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&str, &RecordStatus)> {
        self.statuses.iter().map(|(id, status)| (id.as_str(), status))
    }

    pub fn status(&self, message_id: &str) -> Option<&RecordStatus> {
        self.statuses()
            .find(|(id, _)| *id == message_id)
            .map(|(_, status)| status)
    }

    /// Records to hand back to the transport for redelivery.
    pub fn failed_identities(&self) -> Vec<&str> {
        self.statuses()
            .filter(|(_, status)| !status.is_success())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn succeeded_identities(&self) -> Vec<&str> {
        self.statuses()
            .filter(|(_, status)| status.is_success())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.statuses.iter().all(|(_, status)| status.is_success())
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// The partial batch response understood by SQS event source mappings.
    pub fn response(&self) -> BatchResponse {
        BatchResponse {
            batch_item_failures: self
                .failed_identities()
                .into_iter()
                .map(|id| BatchItemFailure {
                    item_identifier: id.to_string(),
                })
                .collect(),
        }
    }
}

impl Serialize for BatchOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.response().serialize(serializer)
    }
}

/// `{"batchItemFailures":[{"itemIdentifier":"…"}]}`; an empty list means the
/// whole batch succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// What the handler receives for one record.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub payload: T,
    pub context: RecoveredContext,
    pub record: InboundRecord,
}

#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    unwrapper: Unwrapper,
    recoverer: Recoverer,
    config: BatchConfig,
}

enum Pending {
    Running(JoinHandle<Result<(), RecordError>>),
    Done(Result<(), RecordError>),
}

/// Aborts the handler tasks still running when `process` is dropped
/// before it completes.
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl BatchProcessor {
    pub fn new(unwrapper: Unwrapper, recoverer: Recoverer, config: BatchConfig) -> Self {
        Self {
            unwrapper,
            recoverer,
            config,
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Unwraps and decodes the payload, then recovers the trace context,
    /// generating one when the record carries none.
    pub fn prepare<T: DeserializeOwned>(
        &self,
        record: InboundRecord,
    ) -> Result<Delivery<T>, RecordError> {
        let unwrapped = self.unwrapper.unwrap_body(&record.body)?;
        let payload = serde_json::from_value(unwrapped.payload).map_err(|e| {
            RecordError::MalformedPayload(format!("payload does not match the expected type: {e}"))
        })?;
        let context = self
            .recoverer
            .recover(&record, unwrapped.envelope_attributes.as_ref())
            .unwrap_or_else(RecoveredContext::generated);

        Ok(Delivery {
            payload,
            context,
            record,
        })
    }

    /// Runs `handler` over every record and reports one status per record.
    pub async fn process<T, H, Fut>(&self, records: Vec<InboundRecord>, handler: H) -> BatchOutcome
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(Delivery<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut pending = Vec::with_capacity(records.len());
        let mut abort_guard = AbortOnDrop::default();

        for record in records {
            let message_id = record.message_id.clone();
            let delivery = match self.prepare::<T>(record) {
                Ok(delivery) => delivery,
                Err(e) => {
                    pending.push((message_id, Pending::Done(Err(e))));
                    continue;
                }
            };

            // The semaphore is never closed, so the permit is always granted.
            let permit = permits.clone().acquire_owned().await.ok();
            let span = delivery_span(&delivery);
            let handler = handler.clone();
            let timeout = self.config.record_timeout;
            let task = tokio::spawn(
                async move {
                    let _permit = permit;
                    run_handler((*handler)(delivery), timeout).await
                }
                .instrument(span),
            );
            abort_guard.0.push(task.abort_handle());
            pending.push((message_id, Pending::Running(task)));
        }

        let mut outcome = BatchOutcome::with_capacity(pending.len());
        for (message_id, pending) in pending {
            let result = match pending {
                Pending::Done(result) => result,
                Pending::Running(task) => task.await.unwrap_or_else(|e| Err(join_error(e))),
            };
            let status = match result {
                Ok(()) => RecordStatus::Success,
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "record failed");
                    RecordStatus::Error(e)
                }
            };
            outcome.push(message_id, status);
        }

        info!(
            records = outcome.len(),
            failed = outcome.failed_identities().len(),
            "batch processed"
        );
        outcome
    }
}

fn delivery_span<T>(delivery: &Delivery<T>) -> Span {
    let context = &delivery.context;
    let span = info_span!(
        "sqs.process",
        messaging.message.id = %delivery.record.message_id,
        trace_id = %context.identifier.trace_id_hex(),
        trace.origin = %context.origin,
    );
    let _ = span.set_parent(context.identifier.to_context());
    span
}

async fn run_handler<Fut>(future: Fut, timeout: Option<Duration>) -> Result<(), RecordError>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| RecordError::Timeout(limit))?,
        None => future.await,
    };
    result.map_err(callback_error)
}

fn callback_error(err: anyhow::Error) -> RecordError {
    let classification = err
        .downcast_ref::<HandlerFailure>()
        .map(|failure| failure.classification.clone())
        .unwrap_or_else(|| UNCLASSIFIED.to_string());
    RecordError::Callback {
        classification,
        message: format!("{err:#}"),
    }
}

fn join_error(err: JoinError) -> RecordError {
    match err.try_into_panic() {
        Ok(payload) => RecordError::Panicked(panic_message(payload.as_ref())),
        Err(_) => RecordError::Cancelled,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::attributes::MessageAttributes;
    use crate::propagation::{DEFAULT_BACKUP_KEY, DEFAULT_PRIMARY_KEY};
    use crate::recovery::ContextOrigin;

    const ORIGINAL: &str = "00-68dde6a91b7146f84c4bc23f54f17b0f-50d362e330737a0f-01";

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u32,
    }

    fn order(id: u32) -> InboundRecord {
        InboundRecord::new(format!("msg-{id}"), json!({ "id": id }).to_string())
    }

    #[tokio::test]
    async fn test_all_records_succeed() {
        let outcome = BatchProcessor::default()
            .process((0..3).map(order).collect(), |_: Delivery<Order>| async { anyhow::Ok(()) })
            .await;

        assert_eq!(outcome.len(), 3);
        assert!(outcome.all_succeeded());
        assert!(outcome.failed_identities().is_empty());
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({ "batchItemFailures": [] })
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_record() {
        for failing in 0..4u32 {
            let outcome = BatchProcessor::default()
                .process((0..4).map(order).collect(), move |delivery: Delivery<Order>| async move {
                    if delivery.payload.id == failing {
                        anyhow::bail!("order {failing} rejected");
                    }
                    Ok(())
                })
                .await;

            let expected = format!("msg-{failing}");
            assert_eq!(outcome.failed_identities(), vec![expected.as_str()]);
            assert_eq!(outcome.succeeded_identities().len(), 3);
            assert_eq!(
                outcome.status(&expected),
                Some(&RecordStatus::Error(RecordError::Callback {
                    classification: UNCLASSIFIED.to_string(),
                    message: format!("order {failing} rejected"),
                }))
            );
        }
    }

    #[tokio::test]
    async fn test_classified_handler_failure() {
        let outcome = BatchProcessor::default()
            .process(vec![order(1)], |_: Delivery<Order>| async {
                let failure = HandlerFailure::new("validation", "missing customer");
                anyhow::Result::<()>::Err(failure.into())
            })
            .await;

        assert_eq!(
            outcome.status("msg-1"),
            Some(&RecordStatus::Error(RecordError::Callback {
                classification: "validation".to_string(),
                message: "missing customer".to_string(),
            }))
        );
    }

    #[tokio::test]
    async fn test_malformed_body_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let records = vec![
            order(1),
            InboundRecord::new("broken", "{not json"),
            InboundRecord::new("wrong-shape", r#"{"name":"x"}"#),
            order(2),
        ];

        let outcome = BatchProcessor::default()
            .process(records, move |_: Delivery<Order>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.failed_identities(), vec!["broken", "wrong-shape"]);
        assert!(matches!(
            outcome.status("broken"),
            Some(RecordStatus::Error(RecordError::MalformedPayload(_)))
        ));
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({ "batchItemFailures": [
                { "itemIdentifier": "broken" },
                { "itemIdentifier": "wrong-shape" }
            ]})
        );
    }

    #[tokio::test]
    async fn test_timeout_becomes_record_error() {
        let config = BatchConfig {
            record_timeout: Some(Duration::from_millis(20)),
            max_concurrency: 1,
        };
        let outcome = BatchProcessor::default()
            .with_config(config)
            .process(vec![order(1), order(2)], |delivery: Delivery<Order>| async move {
                if delivery.payload.id == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                anyhow::Ok(())
            })
            .await;

        assert_eq!(
            outcome.status("msg-1"),
            Some(&RecordStatus::Error(RecordError::Timeout(Duration::from_millis(20))))
        );
        assert_eq!(outcome.status("msg-2"), Some(&RecordStatus::Success));
    }

    #[tokio::test]
    async fn test_panic_becomes_record_error() {
        let outcome = BatchProcessor::default()
            .process(vec![order(1), order(2)], |delivery: Delivery<Order>| async move {
                if delivery.payload.id == 2 {
                    panic!("handler blew up");
                }
                anyhow::Ok(())
            })
            .await;

        assert_eq!(outcome.status("msg-1"), Some(&RecordStatus::Success));
        assert_eq!(
            outcome.status("msg-2"),
            Some(&RecordStatus::Error(RecordError::Panicked(
                "handler blew up".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_sequential_processing_keeps_delivery_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        BatchProcessor::default()
            .process((0..5).map(order).collect(), move |delivery: Delivery<Order>| {
                let log = log.clone();
                async move {
                    let delay = Duration::from_millis(u64::from(5 - delivery.payload.id));
                    tokio::time::sleep(delay).await;
                    log.lock().unwrap().push(delivery.payload.id);
                    anyhow::Ok(())
                }
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrent_processing_is_bounded_and_ordered() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running_in, peak_in) = (running.clone(), peak.clone());
        let config = BatchConfig {
            record_timeout: None,
            max_concurrency: 2,
        };

        let outcome = BatchProcessor::default()
            .with_config(config)
            .process((0..6).map(order).collect(), move |delivery: Delivery<Order>| {
                let running = running_in.clone();
                let peak = peak_in.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if delivery.payload.id == 3 {
                        anyhow::bail!("nope");
                    }
                    Ok(())
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let ids: Vec<&str> = outcome.statuses().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4", "msg-5"]);
        assert_eq!(outcome.failed_identities(), vec!["msg-3"]);
    }

    #[tokio::test]
    async fn test_handler_receives_recovered_context() {
        let mut attributes = MessageAttributes::new();
        attributes.insert_string(
            DEFAULT_PRIMARY_KEY,
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01",
        );
        attributes.insert_string(DEFAULT_BACKUP_KEY, ORIGINAL);
        let records = vec![
            order(1).with_attributes(attributes),
            order(2),
        ];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        BatchProcessor::default()
            .process(records, move |delivery: Delivery<Order>| {
                log.lock().unwrap().push(delivery.context);
                async { anyhow::Ok(()) }
            })
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].identifier.to_string(), ORIGINAL);
        assert_eq!(seen[0].origin, ContextOrigin::Backup);
        assert!(seen[0].divergence.is_some());
        assert_eq!(seen[1].origin, ContextOrigin::Generated);
    }

    #[test]
    fn test_prepare_unwraps_notification() {
        let body = json!({
            "Type": "Notification",
            "Message": "{\"id\":9}",
            "MessageAttributes": {
                DEFAULT_BACKUP_KEY: { "Type": "String", "Value": ORIGINAL }
            }
        })
        .to_string();

        let delivery: Delivery<Order> = BatchProcessor::default()
            .prepare(InboundRecord::new("m", body))
            .unwrap();

        assert_eq!(delivery.payload.id, 9);
        assert_eq!(delivery.context.identifier.to_string(), ORIGINAL);
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_processes() {
        let outcome = BatchProcessor::default()
            .with_config(BatchConfig {
                record_timeout: None,
                max_concurrency: 0,
            })
            .process(vec![order(1), order(2)], |_: Delivery<Order>| async { anyhow::Ok(()) })
            .await;

        assert_eq!(outcome.succeeded_identities(), vec!["msg-1", "msg-2"]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let outcome = BatchProcessor::default()
            .process(Vec::new(), |_: Delivery<Order>| async { anyhow::Ok(()) })
            .await;

        assert!(outcome.is_empty());
        assert!(outcome.all_succeeded());
    }

    #[tokio::test]
    async fn test_dropping_process_aborts_running_handlers() {
        let (alive, mut finished) = tokio::sync::mpsc::channel::<()>(1);
        let processor = BatchProcessor::default().with_config(BatchConfig {
            record_timeout: None,
            max_concurrency: 2,
        });

        let processing = processor.process(
            (0..2).map(order).collect(),
            move |_: Delivery<Order>| {
                let alive = alive.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(alive);
                    anyhow::Ok(())
                }
            },
        );
        let interrupted = tokio::time::timeout(Duration::from_millis(20), processing).await;
        assert!(interrupted.is_err());

        // Every sender is gone once the aborted tasks have been dropped.
        let closed = tokio::time::timeout(Duration::from_secs(5), finished.recv()).await;
        assert_eq!(closed, Ok(None));
    }
}
