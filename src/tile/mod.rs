//! Tile rendering layer.
//!
//! This module turns fetched images into encoded tiles for the HTTP layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              HTTP Handlers              │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TileProvider               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │ TileFactoryPool │  │
//! │  │  (rendered   │  │ (exclusive      │  │
//! │  │   tiles)     │  │  handles)       │  │
//! │  └──────────────┘  └────────┬────────┘  │
//! └─────────────────────────────┼───────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────┐
//! │     RasterEngine (ImageRasterEngine)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileProvider`]: validates tile addresses, consults the cache, renders misses
//! - [`TileCache`]: LRU cache for rendered tiles bounded by bytes and entries
//! - [`TileFactoryPool`]: bounded pool of non-thread-safe render handles
//! - [`RasterEngine`] / [`TileFactory`]: codec abstraction
//! - [`ImageRasterEngine`]: engine built on the `image` crate
//! - [`TileMatrixSetRegistry`]: the supported OGC tile matrix sets
//! - [`ImageInfo`]: per-image statistics persisted next to the image
//!
//! # Example
//!
//! ```
//! use viewpoint_server::tile::{CachedTile, TileCache, TileCacheKey, TileFormat, Compression};
//! use viewpoint_server::viewpoint::RangeAdjustment;
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = TileCache::with_capacity(50 * 1024 * 1024);
//!
//!     let key = TileCacheKey::Image {
//!         path: "/var/cache/viewpoints/vp-1/image.tif".into(),
//!         tile_size: 512,
//!         z: 0,
//!         x: 1,
//!         y: 2,
//!         format: TileFormat::Png,
//!         compression: Compression::None,
//!         range_adjustment: RangeAdjustment::None,
//!     };
//!
//!     if cache.get(&key).await.is_none() {
//!         cache.put(key, CachedTile::Data(Bytes::from_static(b"png bytes"))).await;
//!     }
//! }
//! ```

mod cache;
mod engine;
mod format;
mod image_engine;
mod info;
mod matrix;
mod pool;
mod provider;

pub use cache::{
    CachedTile, TileCache, TileCacheKey, DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_TILE_CACHE_ENTRIES,
};
pub use engine::{FactoryKey, PixelType, RasterEngine, TileFactory};
pub use format::{Compression, TileFormat};
pub use image_engine::{
    ImageRasterEngine, RasterCacheStats, DEFAULT_JPEG_QUALITY, DEFAULT_RASTER_CACHE_BYTES,
};
pub use info::{
    read_sidecar, sidecar_path, write_sidecar, BandStatistics, BandSummary, CornerCoordinates,
    ImageInfo, ImageStatistics, SIDECAR_SUFFIX,
};
pub use matrix::{
    invert_tile_row, pixel_window, GeoBounds, MapTile, PixelWindow, TileMatrixSet,
    TileMatrixSetRegistry, MAP_TILE_SIZE, MAX_TILE_MATRIX, WEB_MERCATOR_EXTENT,
};
pub use pool::{
    PoolConfig, PoolStats, PooledFactory, TileFactoryPool, DEFAULT_CHECKOUT_TIMEOUT,
    DEFAULT_MAX_HANDLES_PER_KEY, DEFAULT_MAX_KEYS,
};
pub use provider::{ImageTileRequest, MapTileRequest, TileOutcome, TileProvider};
