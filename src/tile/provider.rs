//! Tile provider: the read path from a tile request to encoded bytes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TileProvider                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │         get_image_tile() / get_map_tile()               │    │
//! │  │  1. Validate address   4. Check out a render handle     │    │
//! │  │  2. Build cache key    5. Render on a blocking thread   │    │
//! │  │  3. Check cache        6. Cache & return                │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │           │                      │                              │
//! │           ▼                      ▼                              │
//! │    ┌───────────┐        ┌─────────────────┐                     │
//! │    │ TileCache │        │ TileFactoryPool │──► RasterEngine     │
//! │    └───────────┘        └─────────────────┘                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Invalid addresses are rejected before the cache or the pool is touched.
//! Only successful renders are cached; a tile with no coverage is cached as
//! [`CachedTile::NoContent`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::cache::{CachedTile, TileCache, TileCacheKey};
use super::engine::{FactoryKey, TileFactory};
use super::format::{Compression, TileFormat};
use super::matrix::{invert_tile_row, pixel_window, TileMatrixSetRegistry};
use super::pool::TileFactoryPool;
use crate::error::{RenderError, TileError};
use crate::viewpoint::RangeAdjustment;

// =============================================================================
// Requests
// =============================================================================

/// A pyramid tile addressed in source pixel space.
#[derive(Debug, Clone)]
pub struct ImageTileRequest {
    /// Local path of the fetched image
    pub path: Arc<str>,
    pub tile_size: u32,
    pub z: i64,
    pub x: i64,
    pub y: i64,
    pub format: TileFormat,
    pub compression: Compression,
    pub range_adjustment: RangeAdjustment,
}

/// A tile of a named tile matrix set.
#[derive(Debug, Clone)]
pub struct MapTileRequest {
    pub path: Arc<str>,
    pub tile_matrix_set: String,
    pub tile_matrix: i64,
    pub tile_row: i64,
    pub tile_col: i64,
    /// Rows are counted from the bottom instead of the top
    pub invert_y: bool,
    pub format: TileFormat,
    pub compression: Compression,
    pub range_adjustment: RangeAdjustment,
}

/// Result of a tile lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileOutcome {
    pub tile: CachedTile,
    pub cache_hit: bool,
}

// =============================================================================
// Provider
// =============================================================================

/// Renders tiles through the factory pool and memoises them in the cache.
#[derive(Clone)]
pub struct TileProvider {
    cache: Arc<TileCache>,
    pool: TileFactoryPool,
    tile_matrix_sets: Arc<TileMatrixSetRegistry>,
}

impl TileProvider {
    pub fn new(
        cache: Arc<TileCache>,
        pool: TileFactoryPool,
        tile_matrix_sets: Arc<TileMatrixSetRegistry>,
    ) -> Self {
        Self {
            cache,
            pool,
            tile_matrix_sets,
        }
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn pool(&self) -> &TileFactoryPool {
        &self.pool
    }

    pub fn tile_matrix_sets(&self) -> &TileMatrixSetRegistry {
        &self.tile_matrix_sets
    }

    pub async fn get_image_tile(&self, request: ImageTileRequest) -> Result<TileOutcome, TileError> {
        request.format.check_compression(request.compression)?;
        let window = pixel_window(request.tile_size, request.z, request.x, request.y)?;

        // pixel_window rejects negative and overflowing coordinates
        let key = TileCacheKey::Image {
            path: request.path.clone(),
            tile_size: request.tile_size,
            z: request.z as u32,
            x: request.x as u64,
            y: request.y as u64,
            format: request.format,
            compression: request.compression,
            range_adjustment: request.range_adjustment,
        };

        if let Some(tile) = self.cache.get(&key).await {
            return Ok(TileOutcome {
                tile,
                cache_hit: true,
            });
        }

        let factory_key = FactoryKey::new(
            request.path,
            request.format,
            request.compression,
            request.range_adjustment,
        );
        let size = (request.tile_size, request.tile_size);
        let tile = self
            .render(factory_key, move |factory| factory.create_encoded_tile(window, size))
            .await?;

        self.cache.put(key, tile.clone()).await;
        Ok(TileOutcome {
            tile,
            cache_hit: false,
        })
    }

    pub async fn get_map_tile(&self, request: MapTileRequest) -> Result<TileOutcome, TileError> {
        request.format.check_compression(request.compression)?;
        let tms = self.tile_matrix_sets.get(&request.tile_matrix_set)?;

        let tile_row = if request.invert_y {
            invert_tile_row(request.tile_row, request.tile_matrix)?
        } else {
            request.tile_row
        };
        let map_tile = tms.tile(request.tile_matrix, tile_row, request.tile_col)?;

        let key = TileCacheKey::Map {
            path: request.path.clone(),
            tile_matrix_set: tms.id,
            tile_matrix: map_tile.tile_matrix,
            tile_row: map_tile.tile_row,
            tile_col: map_tile.tile_col,
            format: request.format,
            compression: request.compression,
            range_adjustment: request.range_adjustment,
        };

        if let Some(tile) = self.cache.get(&key).await {
            return Ok(TileOutcome {
                tile,
                cache_hit: true,
            });
        }

        let factory_key = FactoryKey::new(
            request.path,
            request.format,
            request.compression,
            request.range_adjustment,
        );
        let tile = self
            .render(factory_key, move |factory| {
                factory.create_orthophoto_tile(&map_tile.bounds, map_tile.size)
            })
            .await?;

        self.cache.put(key, tile.clone()).await;
        Ok(TileOutcome {
            tile,
            cache_hit: false,
        })
    }

    /// Forget everything rendered from `path`: cached tiles and idle handles.
    pub async fn invalidate_path(&self, path: &str) {
        let tiles = self.cache.invalidate_path(path).await;
        let handles = self.pool.evict_path(path);
        debug!(path, tiles, handles, "Invalidated rendered tiles");
    }

    /// Check out a handle for `key` and run `render` with it on a blocking
    /// thread. The handle goes back to the pool when the task finishes.
    async fn render<F>(&self, key: FactoryKey, render: F) -> Result<CachedTile, TileError>
    where
        F: FnOnce(&mut dyn TileFactory) -> Result<Option<Bytes>, RenderError> + Send + 'static,
    {
        let path = key.path.to_string();
        let mut guard = self.pool.checkout(&key).await?;
        if guard.is_unreadable() {
            return Err(TileError::Unreadable { path });
        }

        let rendered = tokio::task::spawn_blocking(move || guard.factory().map(render))
            .await
            .map_err(|e| TileError::TaskFailed(e.to_string()))?;

        match rendered {
            Some(result) => Ok(CachedTile::from(result?)),
            None => Err(TileError::Unreadable { path }),
        }
    }
}
