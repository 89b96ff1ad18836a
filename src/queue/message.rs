use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// The work a queued request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewpointOperation {
    Create,
    Update,
}

/// Body of a request queue message.
///
/// Encoded as JSON: `{"viewpoint_id": "...", "operation": "CREATE"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewpointRequest {
    pub viewpoint_id: String,
    pub operation: ViewpointOperation,
}

impl ViewpointRequest {
    pub fn create(viewpoint_id: impl Into<String>) -> Self {
        Self {
            viewpoint_id: viewpoint_id.into(),
            operation: ViewpointOperation::Create,
        }
    }

    pub fn update(viewpoint_id: impl Into<String>) -> Self {
        Self {
            viewpoint_id: viewpoint_id.into(),
            operation: ViewpointOperation::Update,
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        serde_json::to_string(self)
            .map_err(|e| QueueError::Fatal(format!("failed to encode request: {}", e)))
    }

    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// A message received from the queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    /// Handle used to acknowledge (delete) this delivery
    pub receipt_handle: String,
    /// How many times this message has been delivered, this delivery included
    pub receive_count: u32,
}

/// At-least-once message queue feeding the worker.
///
/// A received message stays invisible to other receivers until it is deleted
/// or its visibility timeout expires, after which it is delivered again.
#[async_trait]
pub trait RequestQueue: Send + Sync + 'static {
    async fn send(&self, body: String) -> Result<(), QueueError>;

    /// Wait up to `wait` for at most `max_messages` messages.
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn enqueue(&self, request: &ViewpointRequest) -> Result<(), QueueError> {
        self.send(request.encode()?).await
    }
}
