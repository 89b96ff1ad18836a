//! Tile cache for rendered tiles.
//!
//! This module provides an LRU cache for rendered tiles, so repeated requests
//! for the same tile skip the pool and the raster engine entirely.
//!
//! # Cache Key
//!
//! Pixel tiles and map tiles are cached under separate key shapes. Both carry
//! the source path plus every parameter that changes the rendered bytes:
//! format, compression and range adjustment.
//!
//! # Values
//!
//! A tile with no coverage is cached as [`CachedTile::NoContent`] so the
//! empty answer is memoised as well. Errors are never cached.
//!
//! # Eviction
//!
//! The cache is bounded both by entry count and by the total size of cached
//! bytes; least-recently-used entries go first when either bound is exceeded.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;

use super::format::{Compression, TileFormat};
use crate::viewpoint::RangeAdjustment;

/// Default cache capacity: 100MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 100 * 1024 * 1024;

/// Default maximum number of entries
pub const DEFAULT_TILE_CACHE_ENTRIES: usize = 10_000;

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key for rendered tiles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TileCacheKey {
    /// Pyramid tile addressed in source pixel space
    Image {
        path: Arc<str>,
        tile_size: u32,
        z: u32,
        x: u64,
        y: u64,
        format: TileFormat,
        compression: Compression,
        range_adjustment: RangeAdjustment,
    },
    /// Tile of an OGC tile matrix set, row already in top-left convention
    Map {
        path: Arc<str>,
        tile_matrix_set: &'static str,
        tile_matrix: u32,
        tile_row: u32,
        tile_col: u32,
        format: TileFormat,
        compression: Compression,
        range_adjustment: RangeAdjustment,
    },
}

impl TileCacheKey {
    /// Source image the tile was rendered from.
    pub fn path(&self) -> &str {
        match self {
            TileCacheKey::Image { path, .. } | TileCacheKey::Map { path, .. } => path,
        }
    }
}

/// A cached render result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedTile {
    Data(Bytes),
    /// The tile has no coverage
    NoContent,
}

impl CachedTile {
    fn size(&self) -> usize {
        match self {
            CachedTile::Data(data) => data.len(),
            CachedTile::NoContent => 0,
        }
    }
}

impl From<Option<Bytes>> for CachedTile {
    fn from(value: Option<Bytes>) -> Self {
        value.map_or(CachedTile::NoContent, CachedTile::Data)
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheState {
    entries: LruCache<TileCacheKey, CachedTile>,
    size: usize,
}

/// LRU cache for rendered tiles with size-based capacity.
///
/// # Thread Safety
///
/// The cache is thread-safe and can be shared across async tasks via `Arc`.
pub struct TileCache {
    state: RwLock<CacheState>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TileCache {
    /// Create a new tile cache with default capacity (100MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_TILE_CACHE_ENTRIES)
    }

    /// Create a new tile cache bounded by bytes and by entry count.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::new(max_entries),
                size: 0,
            }),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a tile from the cache, marking it as recently used.
    pub async fn get(&self, key: &TileCacheKey) -> Option<CachedTile> {
        let mut state = self.state.write().await;
        let found = state.entries.get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Check if a tile is in the cache without updating LRU order.
    pub async fn contains(&self, key: &TileCacheKey) -> bool {
        self.state.read().await.entries.contains(key)
    }

    /// Store a tile, evicting least-recently-used entries while over capacity.
    ///
    /// A single tile larger than the whole capacity is not cached.
    pub async fn put(&self, key: TileCacheKey, tile: CachedTile) {
        let tile_size = tile.size();
        if tile_size > self.max_size {
            return;
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(old) = state.entries.peek(&key) {
            state.size = state.size.saturating_sub(old.size());
        }

        // push() hands back whatever the entry bound pushed out
        if let Some((evicted_key, evicted)) = state.entries.push(key.clone(), tile) {
            if evicted_key != key {
                state.size = state.size.saturating_sub(evicted.size());
            }
        }
        state.size += tile_size;

        while state.size > self.max_size {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.size = state.size.saturating_sub(evicted.size()),
                None => break,
            }
        }
    }

    /// Remove a tile from the cache.
    pub async fn remove(&self, key: &TileCacheKey) -> Option<CachedTile> {
        let mut state = self.state.write().await;
        let removed = state.entries.pop(key)?;
        state.size = state.size.saturating_sub(removed.size());
        Some(removed)
    }

    /// Drop every cached tile rendered from `path`. Returns the number removed.
    pub async fn invalidate_path(&self, path: &str) -> usize {
        let mut state = self.state.write().await;
        let keys: Vec<TileCacheKey> = state
            .entries
            .iter()
            .filter(|(key, _)| key.path() == path)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(removed) = state.entries.pop(key) {
                state.size = state.size.saturating_sub(removed.size());
            }
        }
        keys.len()
    }

    /// Clear all entries from the cache.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.size = 0;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Get the current total size of cached tiles in bytes.
    pub async fn size(&self) -> usize {
        self.state.read().await.size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
