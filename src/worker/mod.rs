//! Background worker that drives viewpoints through their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  receive (long poll)  ┌──────────────────┐
//! │ RequestQueue │ ────────────────────► │ ViewpointWorker  │
//! │              │ ◄──────────────────── │  (one task)      │
//! └──────────────┘  delete after persist └───────┬──────────┘
//!                                                │
//!               ┌────────────────────────────────┼──────────────────────┐
//!               ▼                                ▼                      ▼
//!       ┌───────────────┐              ┌──────────────────┐    ┌────────────────┐
//!       │ ObjectSource  │              │  RasterEngine    │    │ ViewpointStore │
//!       │ fetch to disk │              │  describe image  │    │ status writes  │
//!       └───────────────┘              └──────────────────┘    └────────────────┘
//! ```
//!
//! Messages are processed one at a time. A failing message never stops the
//! loop; it is either acknowledged with the viewpoint marked `FAILED` or left
//! for redelivery.
//!
//! # Example
//!
//! ```ignore
//! let worker = ViewpointWorker::new(queue, store, source, engine, WorkerConfig::new("/var/cache/viewpoints"));
//! let handle = worker.spawn();
//! // ...
//! handle.shutdown(Duration::from_secs(30)).await;
//! ```

mod processor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::io::ObjectSource;
use crate::queue::{QueueMessage, RequestQueue};
use crate::tile::RasterEngine;
use crate::viewpoint::ViewpointStore;

pub use processor::Disposition;
use processor::MessageProcessor;

/// Default number of messages requested per receive.
pub const DEFAULT_BATCH_SIZE: usize = 1;

/// Default long-poll wait per receive.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(20);

/// Default number of deliveries before transient failures become permanent.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

/// Default pause after a failed receive.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Tile size assigned to viewpoints created without one.
pub const DEFAULT_TILE_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub wait_time: Duration,
    /// Root directory for fetched images
    pub cache_dir: PathBuf,
    pub max_receive_count: u32,
    pub error_backoff: Duration,
    pub default_tile_size: u32,
}

impl WorkerConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            wait_time: DEFAULT_WAIT_TIME,
            cache_dir: cache_dir.into(),
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            default_tile_size: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count.max(1);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Consumes viewpoint requests from the queue.
pub struct ViewpointWorker {
    queue: Arc<dyn RequestQueue>,
    processor: MessageProcessor,
    config: WorkerConfig,
}

impl ViewpointWorker {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        store: Arc<dyn ViewpointStore>,
        source: Arc<dyn ObjectSource>,
        engine: Arc<dyn RasterEngine>,
        config: WorkerConfig,
    ) -> Self {
        let processor = MessageProcessor::new(
            store,
            source,
            engine,
            config.cache_dir.clone(),
            config.max_receive_count,
            config.default_tile_size,
        );
        Self {
            queue,
            processor,
            config,
        }
    }

    /// Run the worker on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(self.run(token.clone()));
        WorkerHandle { token, join }
    }

    /// Process messages until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts the long poll and the error backoff, never a
    /// message that is already being processed.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            wait_secs = self.config.wait_time.as_secs(),
            cache_dir = %self.config.cache_dir.display(),
            "Viewpoint worker starting"
        );

        loop {
            let received = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                received = self.queue.receive(self.config.batch_size, self.config.wait_time) => received,
            };

            match received {
                Ok(messages) => {
                    for message in messages {
                        if shutdown.is_cancelled() {
                            // Unstarted messages become visible again after their timeout
                            break;
                        }
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive from request queue");
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => break,

                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!("Viewpoint worker shutting down");
    }

    /// Process one message and acknowledge it when processing allows.
    pub async fn handle(&self, message: QueueMessage) -> Disposition {
        let disposition = self.processor.process(&message).await;

        if disposition == Disposition::Acknowledge {
            if let Err(e) = self.queue.delete(&message.receipt_handle).await {
                // Redelivery re-runs idempotent steps only
                warn!(error = %e, "Failed to acknowledge message");
            }
        } else {
            debug!(receive_count = message.receive_count, "Message left for redelivery");
        }
        disposition
    }
}

/// Handle on a spawned worker task.
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the worker, waiting up to `timeout` for the in-flight message.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.token.cancel();
        let mut join = self.join;

        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Viewpoint worker task failed");
                true
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Worker did not stop in time, aborting");
                join.abort();
                false
            }
        }
    }
}
