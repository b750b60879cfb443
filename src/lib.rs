//! Shared pieces of the SNS/SQS tracing binaries.

pub mod config;
pub mod pipeline;
pub mod telemetry;

use serde::{Deserialize, Serialize};

/// The business message the binaries publish and consume.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub content: String,
    pub timestamp: String,
}

impl Message {
    pub fn new(id: u32, content: impl Into<String>) -> Self {
        Self {
            id,
            content: content.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
