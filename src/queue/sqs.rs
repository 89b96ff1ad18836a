use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use tracing::warn;

use super::message::{QueueMessage, RequestQueue};
use crate::error::QueueError;

/// SQS caps a single receive at 10 messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// SQS caps long polling at 20 seconds.
const MAX_WAIT_SECONDS: u64 = 20;

const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "KmsThrottled",
];

/// Request queue backed by an SQS queue URL.
#[derive(Clone)]
pub struct SqsRequestQueue {
    client: Client,
    queue_url: String,
}

impl SqsRequestQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl RequestQueue for SqsRequestQueue {
    async fn send(&self, body: String) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| classify_sdk_error("SendMessage", e))?;
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let max_messages = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32;
        let wait_seconds = wait.as_secs().min(MAX_WAIT_SECONDS) as i32;

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| classify_sdk_error("ReceiveMessage", e))?;

        let mut batch = Vec::new();
        for message in output.messages() {
            let Some(receipt_handle) = message.receipt_handle() else {
                warn!(message_id = ?message.message_id(), "Dropping message without receipt handle");
                continue;
            };
            let receive_count = message
                .attributes()
                .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);

            batch.push(QueueMessage {
                body: message.body().unwrap_or_default().to_string(),
                receipt_handle: receipt_handle.to_string(),
                receive_count,
            });
        }
        Ok(batch)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| classify_sdk_error("DeleteMessage", e))?;
        Ok(())
    }
}

fn classify_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            QueueError::Transient(message)
        }
        SdkError::ServiceError(service)
            if TRANSIENT_ERROR_CODES.contains(&service.err().code().unwrap_or_default()) =>
        {
            QueueError::Transient(message)
        }
        _ => QueueError::Fatal(message),
    }
}
