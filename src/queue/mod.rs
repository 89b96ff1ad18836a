//! Request queue between the HTTP API and the worker.
//!
//! Delivery is at-least-once: a message is redelivered until the worker
//! deletes it, so processing must be idempotent.

mod memory;
mod message;
mod sqs;

pub use memory::{MemoryQueue, DEFAULT_VISIBILITY_TIMEOUT};
pub use message::{QueueMessage, RequestQueue, ViewpointOperation, ViewpointRequest};
pub use sqs::SqsRequestQueue;
