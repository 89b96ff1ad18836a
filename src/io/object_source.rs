use std::future::Future;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::IoError;

/// Copies source objects (bucket + key) to local files.
///
/// Fetching is idempotent: fetching the same object twice overwrites the
/// destination with a complete copy. A partially written download is never
/// visible at `dest`.
#[async_trait]
pub trait ObjectSource: Send + Sync + 'static {
    /// Copy `bucket`/`key` to `dest`, returning the number of bytes written.
    ///
    /// Returns `IoError::NotFound` when the object does not exist.
    async fn fetch_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, IoError>;
}

/// Sibling path downloads are written to before being renamed into place.
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

pub(crate) async fn ensure_parent_dir(dest: &Path) -> Result<(), IoError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write `dest` through its `.part` sibling.
///
/// `write` fills the partial file and returns the bytes written. On success
/// the partial file is renamed over `dest`; on any failure it is removed so
/// no truncated download is left behind.
pub(crate) async fn write_via_partial<F, Fut>(dest: &Path, write: F) -> Result<u64, IoError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<u64, IoError>>,
{
    ensure_parent_dir(dest).await?;
    let partial = partial_path(dest);

    let result = match write(partial.clone()).await {
        Ok(bytes) => tokio::fs::rename(&partial, dest)
            .await
            .map(|_| bytes)
            .map_err(IoError::from),
        Err(e) => Err(e),
    };

    if result.is_err() {
        discard_partial(&partial).await;
    }
    result
}

async fn discard_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
        }
    }
}

/// Object keys must stay inside their bucket.
pub(crate) fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

// =============================================================================
// Local Directory Source
// =============================================================================

/// Serves objects from `<root>/<bucket>/<key>` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectSource {
    root: PathBuf,
}

impl LocalObjectSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, IoError> {
        if !is_safe_key(bucket) || !is_safe_key(key) {
            return Err(IoError::NotFound(format!("{}/{}", bucket, key)));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl ObjectSource for LocalObjectSource {
    async fn fetch_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, IoError> {
        let source = self.object_path(bucket, key)?;

        match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(IoError::NotFound(source.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IoError::NotFound(source.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let bytes = write_via_partial(dest, |partial| {
            let source = source.clone();
            async move { Ok::<_, IoError>(tokio::fs::copy(&source, &partial).await?) }
        })
        .await?;

        debug!(
            source = %source.display(),
            dest = %dest.display(),
            bytes = bytes,
            "Copied local object"
        );
        Ok(bytes)
    }
}
