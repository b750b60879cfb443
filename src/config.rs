//! Environment configuration for the binaries.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use opentelemetry_aws_messaging::batch::DEFAULT_RECORD_TIMEOUT;
use opentelemetry_aws_messaging::propagation::{DEFAULT_BACKUP_KEY, DEFAULT_PRIMARY_KEY};
use opentelemetry_aws_messaging::{BatchConfig, CarrierKeys};

pub const DEFAULT_SERVICE_NAME: &str = "sns-sqs-tracing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub topic_arn: Option<String>,
    pub queue_url: Option<String>,
    pub carrier_keys: CarrierKeys,
    pub batch: BatchConfig,
    pub service_name: String,
    /// Identifier handed over by an upstream caller, used ahead of the active span.
    pub traceparent: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any name to value lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let carrier_keys = CarrierKeys::new(
            var("TRACE_PRIMARY_ATTRIBUTE").unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string()),
            var("TRACE_BACKUP_ATTRIBUTE").unwrap_or_else(|| DEFAULT_BACKUP_KEY.to_string()),
        )
        .context("Invalid trace carrier attribute names")?;

        let timeout_ms = parse_number::<u64>("RECORD_TIMEOUT_MS", var("RECORD_TIMEOUT_MS"))?;
        let record_timeout = match timeout_ms {
            Some(0) => None,
            Some(millis) => Some(Duration::from_millis(millis)),
            None => Some(DEFAULT_RECORD_TIMEOUT),
        };
        let max_concurrency =
            parse_number::<usize>("MAX_CONCURRENCY", var("MAX_CONCURRENCY"))?.unwrap_or(1);

        Ok(Self {
            topic_arn: var("SNS_TOPIC_ARN"),
            queue_url: var("SQS_QUEUE_URL"),
            carrier_keys,
            batch: BatchConfig {
                record_timeout,
                max_concurrency,
            },
            service_name: var("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            traceparent: var("TRACEPARENT"),
        })
    }

    pub fn topic_arn(&self) -> Result<&str> {
        self.topic_arn
            .as_deref()
            .context("SNS_TOPIC_ARN environment variable not set")
    }

    pub fn queue_url(&self) -> Result<&str> {
        self.queue_url
            .as_deref()
            .context("SQS_QUEUE_URL environment variable not set")
    }
}

fn parse_number<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| anyhow!("{name} must be a non-negative integer, got `{raw}`: {e}"))
        })
        .transpose()
}
