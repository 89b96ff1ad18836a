//! # Viewpoint Server
//!
//! A tile server for imagery held in S3-compatible object storage.
//!
//! Clients register an image as a *viewpoint*. A background worker fetches the
//! image to local disk and records its statistics; once the viewpoint is
//! `READY` the HTTP API serves pyramid tiles in source pixel space and tiles
//! of OGC tile matrix sets.
//!
//! ## Features
//!
//! - **Queue-driven preparation**: create and update requests flow through SQS
//!   (or an in-memory queue) with at-least-once delivery
//! - **Durable lifecycle**: viewpoint records live in DynamoDB with conditional
//!   status transitions
//! - **Bounded rendering**: a pool of exclusive render handles per image
//! - **Tile caching**: rendered tiles, including empty ones, are cached by
//!   their full request parameters
//!
//! ## Architecture
//!
//! - [`viewpoint`] - Viewpoint records, lifecycle rules and the state store
//! - [`queue`] - Viewpoint request messages and queues
//! - [`io`] - Object sources that fetch images to local disk
//! - [`worker`] - Background worker that prepares viewpoints
//! - [`tile`] - Tile addressing, rendering, pooling and caching
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use viewpoint_server::{
//!     create_router, AppState, ImageRasterEngine, MemoryQueue, MemoryViewpointStore,
//!     RouterConfig, TileCache, TileFactoryPool, TileMatrixSetRegistry, TileProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = TileFactoryPool::new(Arc::new(ImageRasterEngine::new()));
//!     let tiles = TileProvider::new(
//!         Arc::new(TileCache::new()),
//!         pool,
//!         Arc::new(TileMatrixSetRegistry::new()),
//!     );
//!     let state = AppState::new(
//!         Arc::new(MemoryViewpointStore::new()),
//!         Arc::new(MemoryQueue::new()),
//!         tiles,
//!     );
//!
//!     let router = create_router(state, RouterConfig::new());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod queue;
pub mod server;
pub mod tile;
pub mod viewpoint;
pub mod worker;

// Re-export commonly used types
pub use config::{Backend, Config};
pub use error::{IoError, QueueError, RenderError, StoreError, StoreResult, TileError};
pub use io::{LocalObjectSource, ObjectSource, S3ObjectSource};
pub use queue::{MemoryQueue, QueueMessage, RequestQueue, SqsRequestQueue, ViewpointRequest};
pub use server::{create_router, ApiError, AppState, ErrorResponse, RouterConfig};
pub use tile::{
    CachedTile, Compression, ImageRasterEngine, RasterEngine, TileCache, TileCacheKey,
    TileFactory, TileFactoryPool, TileFormat, TileMatrixSetRegistry, TileProvider,
};
pub use viewpoint::{
    DynamoViewpointStore, MemoryViewpointStore, RangeAdjustment, ViewpointRecord,
    ViewpointStatus, ViewpointStore,
};
pub use worker::{ViewpointWorker, WorkerConfig, WorkerHandle};
