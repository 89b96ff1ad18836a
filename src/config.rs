//! Configuration management for the viewpoint server.
//!
//! Settings come from command-line arguments via clap, fall back to
//! environment variables with the `TILE_SERVER_` prefix and then to the
//! defaults below.
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use viewpoint_server::config::Config;
//!
//! let config = Config::parse();
//! config.validate()?;
//! println!("Listening on {}", config.bind_address());
//! ```
//!
//! # Environment Variables
//!
//! - `TILE_SERVER_HOST` / `TILE_SERVER_PORT` - Bind address (default: 0.0.0.0:8080)
//! - `TILE_SERVER_BACKEND` - `aws` or `local` (default: aws)
//! - `TILE_SERVER_AWS_REGION` - AWS region (default: us-east-1)
//! - `TILE_SERVER_S3_ENDPOINT` - Custom S3 endpoint for S3-compatible services
//! - `TILE_SERVER_VIEWPOINT_TABLE` - DynamoDB table of viewpoint records
//! - `TILE_SERVER_QUEUE_URL` - SQS queue of viewpoint requests
//! - `TILE_SERVER_LOCAL_SOURCE_ROOT` - Object root for the local backend
//! - `TILE_SERVER_CACHE_DIR` - Directory for fetched images
//! - `TILE_SERVER_TILE_CACHE_ENTRIES` / `TILE_SERVER_TILE_CACHE_BYTES` - Rendered tile cache bounds
//! - `TILE_SERVER_RASTER_CACHE_BYTES` - Decoded source rasters kept for reuse
//! - `TILE_SERVER_POOL_HANDLES_PER_KEY` / `TILE_SERVER_POOL_KEYS` - Render handle pool bounds
//! - `TILE_SERVER_CHECKOUT_TIMEOUT_SECS` - Wait for a free render handle
//! - `TILE_SERVER_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)
//! - `TILE_SERVER_WORKER_BATCH_SIZE`, `TILE_SERVER_WORKER_WAIT_SECS`, `TILE_SERVER_MAX_RECEIVE_COUNT`
//! - `TILE_SERVER_SHUTDOWN_TIMEOUT_SECS` - Grace period for the worker on shutdown
//! - `TILE_SERVER_CORS_ORIGINS` - Comma-separated allowed origins

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::server::DEFAULT_CACHE_MAX_AGE;
use crate::tile::{
    DEFAULT_MAX_HANDLES_PER_KEY, DEFAULT_MAX_KEYS, DEFAULT_RASTER_CACHE_BYTES,
    DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_TILE_CACHE_ENTRIES,
};
use crate::worker::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_RECEIVE_COUNT};

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 8080;

pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_VIEWPOINT_TABLE: &str = "TSJobs";

pub const DEFAULT_CACHE_DIR: &str = "/tmp/viewpoint-server";

/// Seconds to wait for a render handle before answering 503.
pub const DEFAULT_CHECKOUT_TIMEOUT_SECS: u64 = 10;

/// SQS long-poll wait in seconds.
pub const DEFAULT_WORKER_WAIT_SECS: u64 = 20;

pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Where viewpoint records, requests and images live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// DynamoDB, SQS and S3
    Aws,
    /// In-memory store and queue, images from a local directory
    Local,
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// Viewpoint tile server.
///
/// Registers images held in object storage as viewpoints, prepares them in
/// the background and serves pyramid and map tiles over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "viewpoint-server")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "TILE_SERVER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TILE_SERVER_PORT")]
    pub port: u16,

    /// Storage backend.
    #[arg(long, value_enum, default_value_t = Backend::Aws, env = "TILE_SERVER_BACKEND")]
    pub backend: Backend,

    // =========================================================================
    // AWS
    // =========================================================================
    #[arg(long, default_value = DEFAULT_REGION, env = "TILE_SERVER_AWS_REGION")]
    pub aws_region: String,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "TILE_SERVER_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// DynamoDB table holding viewpoint records.
    #[arg(long, default_value = DEFAULT_VIEWPOINT_TABLE, env = "TILE_SERVER_VIEWPOINT_TABLE")]
    pub viewpoint_table: String,

    /// SQS queue URL for viewpoint requests. Required for the aws backend.
    #[arg(long, env = "TILE_SERVER_QUEUE_URL")]
    pub queue_url: Option<String>,

    // =========================================================================
    // Local
    // =========================================================================
    /// Directory standing in for object storage: objects live at
    /// `<root>/<bucket>/<key>`. Required for the local backend.
    #[arg(long, env = "TILE_SERVER_LOCAL_SOURCE_ROOT")]
    pub local_source_root: Option<PathBuf>,

    /// Directory fetched images and their statistics are written to.
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "TILE_SERVER_CACHE_DIR")]
    pub cache_dir: PathBuf,

    // =========================================================================
    // Tiles
    // =========================================================================
    /// Maximum number of rendered tiles to cache.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_ENTRIES, env = "TILE_SERVER_TILE_CACHE_ENTRIES")]
    pub tile_cache_entries: usize,

    /// Maximum total size of rendered tiles to cache, in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "TILE_SERVER_TILE_CACHE_BYTES")]
    pub tile_cache_bytes: usize,

    /// Decoded source rasters kept between handle opens, in bytes.
    #[arg(long, default_value_t = DEFAULT_RASTER_CACHE_BYTES, env = "TILE_SERVER_RASTER_CACHE_BYTES")]
    pub raster_cache_bytes: usize,

    /// Render handles kept per image variant.
    #[arg(long, default_value_t = DEFAULT_MAX_HANDLES_PER_KEY, env = "TILE_SERVER_POOL_HANDLES_PER_KEY")]
    pub pool_handles_per_key: usize,

    /// Image variants with live render handles.
    #[arg(long, default_value_t = DEFAULT_MAX_KEYS, env = "TILE_SERVER_POOL_KEYS")]
    pub pool_keys: usize,

    #[arg(long, default_value_t = DEFAULT_CHECKOUT_TIMEOUT_SECS, env = "TILE_SERVER_CHECKOUT_TIMEOUT_SECS")]
    pub checkout_timeout_secs: u64,

    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "TILE_SERVER_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    // =========================================================================
    // Worker
    // =========================================================================
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, env = "TILE_SERVER_WORKER_BATCH_SIZE")]
    pub worker_batch_size: usize,

    #[arg(long, default_value_t = DEFAULT_WORKER_WAIT_SECS, env = "TILE_SERVER_WORKER_WAIT_SECS")]
    pub worker_wait_secs: u64,

    /// Deliveries of a request before a transient failure becomes permanent.
    #[arg(long, default_value_t = DEFAULT_MAX_RECEIVE_COUNT, env = "TILE_SERVER_MAX_RECEIVE_COUNT")]
    pub max_receive_count: u32,

    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_SECS, env = "TILE_SERVER_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,

    // =========================================================================
    // CORS
    // =========================================================================
    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "TILE_SERVER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        match self.backend {
            Backend::Aws => {
                if self.queue_url.as_deref().map_or(true, str::is_empty) {
                    return Err(
                        "SQS queue URL is required for the aws backend. \
                         Set --queue-url or TILE_SERVER_QUEUE_URL"
                            .to_string(),
                    );
                }
                if self.viewpoint_table.is_empty() {
                    return Err("viewpoint_table must not be empty".to_string());
                }
            }
            Backend::Local => {
                if self.local_source_root.is_none() {
                    return Err(
                        "A local source root is required for the local backend. \
                         Set --local-source-root or TILE_SERVER_LOCAL_SOURCE_ROOT"
                            .to_string(),
                    );
                }
            }
        }

        if let Some(endpoint) = &self.s3_endpoint {
            let parsed = url::Url::parse(endpoint)
                .map_err(|e| format!("Invalid S3 endpoint '{}': {}", endpoint, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(format!(
                    "S3 endpoint must use http or https, got '{}'",
                    parsed.scheme()
                ));
            }
        }

        if self.tile_cache_entries == 0 {
            return Err("tile_cache_entries must be greater than 0".to_string());
        }
        if self.tile_cache_bytes == 0 {
            return Err("tile_cache_bytes must be greater than 0".to_string());
        }
        if self.pool_handles_per_key == 0 {
            return Err("pool_handles_per_key must be greater than 0".to_string());
        }
        if self.pool_keys == 0 {
            return Err("pool_keys must be greater than 0".to_string());
        }
        if self.worker_batch_size == 0 || self.worker_batch_size > 10 {
            return Err("worker_batch_size must be between 1 and 10".to_string());
        }
        if self.worker_wait_secs > 20 {
            return Err("worker_wait_secs must be at most 20".to_string());
        }
        if self.max_receive_count == 0 {
            return Err("max_receive_count must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }

    pub fn worker_wait_time(&self) -> Duration {
        Duration::from_secs(self.worker_wait_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
