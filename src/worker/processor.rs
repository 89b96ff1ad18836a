//! Processing of a single queue message.
//!
//! Every step is idempotent: the fetch overwrites the local copy atomically,
//! the sidecar is rewritten whole, and status writes are conditional on the
//! record's current status. A message is acknowledged only once its final
//! status write has been persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{IoError, RenderError, StoreError};
use crate::io::ObjectSource;
use crate::queue::{QueueMessage, ViewpointRequest};
use crate::tile::{write_sidecar, ImageInfo, RasterEngine};
use crate::viewpoint::{ViewpointRecord, ViewpointStatus, ViewpointStore, ViewpointUpdate};

/// What to do with a message once processing stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message from the queue
    Acknowledge,
    /// Leave the message for redelivery after its visibility timeout
    Redeliver,
}

/// Failure while fetching and describing an image.
#[derive(Debug, Error)]
enum PrepareError {
    #[error("failed to fetch source object: {0}")]
    Fetch(#[from] IoError),

    #[error("{0}")]
    Render(#[from] RenderError),

    #[error("image inspection task failed: {0}")]
    Task(String),
}

impl PrepareError {
    fn is_transient(&self) -> bool {
        match self {
            PrepareError::Fetch(e) => e.is_transient(),
            PrepareError::Render(_) => false,
            PrepareError::Task(_) => true,
        }
    }
}

/// A fetched and described image.
struct Prepared {
    local_path: PathBuf,
    info: ImageInfo,
}

pub(crate) struct MessageProcessor {
    store: Arc<dyn ViewpointStore>,
    source: Arc<dyn ObjectSource>,
    engine: Arc<dyn RasterEngine>,
    cache_dir: PathBuf,
    max_receive_count: u32,
    default_tile_size: u32,
}

impl MessageProcessor {
    pub(crate) fn new(
        store: Arc<dyn ViewpointStore>,
        source: Arc<dyn ObjectSource>,
        engine: Arc<dyn RasterEngine>,
        cache_dir: PathBuf,
        max_receive_count: u32,
        default_tile_size: u32,
    ) -> Self {
        Self {
            store,
            source,
            engine,
            cache_dir,
            max_receive_count,
            default_tile_size,
        }
    }

    pub(crate) async fn process(&self, message: &QueueMessage) -> Disposition {
        let request = match ViewpointRequest::decode(&message.body) {
            Ok(request) => request,
            Err(e) => {
                warn!(body = %message.body, error = %e, "Discarding undecodable message");
                return Disposition::Acknowledge;
            }
        };

        let id = request.viewpoint_id.as_str();
        debug!(
            viewpoint_id = %id,
            operation = ?request.operation,
            receive_count = message.receive_count,
            "Processing viewpoint request"
        );

        let record = match self.store.get(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                info!(viewpoint_id = %id, "Viewpoint no longer exists, skipping");
                return Disposition::Acknowledge;
            }
            Err(e) => return store_failure(id, "load", e),
        };

        match record.viewpoint_status {
            ViewpointStatus::Deleted => {
                debug!(viewpoint_id = %id, "Viewpoint deleted, skipping");
                Disposition::Acknowledge
            }
            ViewpointStatus::Failed => {
                debug!(viewpoint_id = %id, "Viewpoint already failed, skipping");
                Disposition::Acknowledge
            }
            ViewpointStatus::Ready => self.refresh(&record, message.receive_count).await,
            ViewpointStatus::Requested => {
                let update = ViewpointUpdate::status(ViewpointStatus::InProgress);
                match self.store.update(id, update).await {
                    Ok(record) => self.complete(&record, message.receive_count).await,
                    Err(e) => store_failure(id, "mark in progress", e),
                }
            }
            ViewpointStatus::InProgress => self.complete(&record, message.receive_count).await,
        }
    }

    /// Drive an `IN_PROGRESS` viewpoint to `READY` or `FAILED`.
    async fn complete(&self, record: &ViewpointRecord, receive_count: u32) -> Disposition {
        let id = record.viewpoint_id.as_str();

        let update = match self.prepare(record).await {
            Ok(prepared) => {
                info!(
                    viewpoint_id = %id,
                    path = %prepared.local_path.display(),
                    width = prepared.info.width,
                    height = prepared.info.height,
                    "Viewpoint ready"
                );
                self.derived_fields(record, &prepared)
                    .with_status(ViewpointStatus::Ready)
                    .clearing_error()
            }
            Err(e) if e.is_transient() && receive_count < self.max_receive_count => {
                warn!(
                    viewpoint_id = %id,
                    error = %e,
                    receive_count,
                    "Transient failure, leaving message for redelivery"
                );
                return Disposition::Redeliver;
            }
            Err(e) => {
                error!(viewpoint_id = %id, error = %e, "Viewpoint processing failed");
                ViewpointUpdate::status(ViewpointStatus::Failed).with_error_message(e.to_string())
            }
        };

        match self.store.update(id, update).await {
            Ok(_) => Disposition::Acknowledge,
            Err(e) => store_failure(id, "persist final status", e),
        }
    }

    /// Re-derive the derived fields of a `READY` viewpoint without touching
    /// its status.
    async fn refresh(&self, record: &ViewpointRecord, receive_count: u32) -> Disposition {
        let id = record.viewpoint_id.as_str();

        let prepared = match self.prepare(record).await {
            Ok(prepared) => prepared,
            Err(e) if e.is_transient() && receive_count < self.max_receive_count => {
                warn!(viewpoint_id = %id, error = %e, "Transient failure refreshing viewpoint");
                return Disposition::Redeliver;
            }
            Err(e) => {
                error!(viewpoint_id = %id, error = %e, "Failed to refresh ready viewpoint");
                return Disposition::Acknowledge;
            }
        };

        match self.store.update(id, self.derived_fields(record, &prepared)).await {
            Ok(_) => {
                info!(viewpoint_id = %id, "Viewpoint refreshed");
                Disposition::Acknowledge
            }
            Err(e) => store_failure(id, "persist refreshed fields", e),
        }
    }

    fn derived_fields(&self, record: &ViewpointRecord, prepared: &Prepared) -> ViewpointUpdate {
        let mut update =
            ViewpointUpdate::new().with_local_object_path(prepared.local_path.display().to_string());
        if record.tile_size.is_none() {
            update = update.with_tile_size(self.default_tile_size);
        }
        update
    }

    async fn prepare(&self, record: &ViewpointRecord) -> Result<Prepared, PrepareError> {
        let local_path = local_object_path(&self.cache_dir, record);

        let bytes = self
            .source
            .fetch_to(&record.bucket_name, &record.object_key, &local_path)
            .await?;
        debug!(
            viewpoint_id = %record.viewpoint_id,
            bytes,
            path = %local_path.display(),
            "Fetched source object"
        );

        let engine = self.engine.clone();
        let path = local_path.clone();
        let info = tokio::task::spawn_blocking(move || engine.describe(&path))
            .await
            .map_err(|e| PrepareError::Task(e.to_string()))??;

        write_sidecar(&local_path, &info).await?;
        Ok(Prepared { local_path, info })
    }
}

/// `<cache_dir>/<viewpoint_id>/<object file name>`
pub(crate) fn local_object_path(cache_dir: &Path, record: &ViewpointRecord) -> PathBuf {
    let file_name = Path::new(&record.object_key)
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "object".into());
    cache_dir.join(&record.viewpoint_id).join(file_name)
}

fn store_failure(id: &str, action: &str, e: StoreError) -> Disposition {
    match e {
        StoreError::Transient(_) => {
            warn!(viewpoint_id = %id, action, error = %e, "Store unavailable, will retry");
            Disposition::Redeliver
        }
        StoreError::Conflict(_) | StoreError::NotFound(_) => {
            info!(viewpoint_id = %id, action, error = %e, "Viewpoint changed concurrently, skipping");
            Disposition::Acknowledge
        }
        StoreError::Fatal(_) => {
            error!(viewpoint_id = %id, action, error = %e, "Store rejected write");
            Disposition::Acknowledge
        }
    }
}
