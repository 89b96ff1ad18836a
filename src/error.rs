use thiserror::Error;

/// Errors raised while copying a source object to local disk.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Local filesystem error while writing the cached copy
    #[error("Local I/O error: {0}")]
    Local(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Storage refused the request in a way retrying cannot fix
    /// (access denied, missing bucket, archived object)
    #[error("S3 request rejected: {0}")]
    Rejected(String),
}

impl IoError {
    /// Whether a later attempt may succeed.
    ///
    /// Missing and rejected objects stay that way; everything else is worth
    /// another delivery.
    pub fn is_transient(&self) -> bool {
        !matches!(self, IoError::NotFound(_) | IoError::Rejected(_))
    }
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::Local(err.to_string())
    }
}

/// Errors returned by the viewpoint state store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("viewpoint not found: {0}")]
    NotFound(String),

    /// Duplicate id or a status transition the record does not allow
    #[error("conflict: {0}")]
    Conflict(String),

    /// Throttling, timeouts and connectivity problems
    #[error("transient store error: {0}")]
    Transient(String),

    /// Malformed stored data or a request the backend will never accept
    #[error("store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result type for state store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by the request queue.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("transient queue error: {0}")]
    Transient(String),

    #[error("queue error: {0}")]
    Fatal(String),
}

/// Errors raised by a raster engine while opening, describing or rendering an image.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The file could not be opened or decoded as an image
    #[error("unreadable image {path}: {message}")]
    Unreadable { path: String, message: String },

    /// The output format or compression is not supported by the engine
    #[error("unsupported output: {0}")]
    Unsupported(String),

    /// Encoding the output tile failed
    #[error("failed to encode tile: {0}")]
    Encode(String),
}

/// Errors that can occur while serving a tile.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Malformed tile parameters (negative level, coordinates out of range, ...)
    #[error("Invalid tile request: {message}")]
    InvalidRequest { message: String },

    #[error("Unsupported tile set: {id}")]
    UnknownTileMatrixSet { id: String },

    /// The pool could not open the image for this variant
    #[error("Unable to read tiles from viewpoint {path}")]
    Unreadable { path: String },

    /// No handle for this image became free within the checkout timeout
    #[error("All render handles for {path} are busy")]
    PoolExhausted { path: String },

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// The render task panicked or was cancelled
    #[error("Render task failed: {0}")]
    TaskFailed(String),
}

impl TileError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TileError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TileError::PoolExhausted { .. })
    }
}
