//! Tile provider integration tests against real images on disk.
//!
//! Tests verify:
//! - Concurrent requests for one image share a bounded set of handles
//! - A busy pool answers with a retryable error
//! - Range adjustments produce separate cache entries and handles
//! - Invalidation drops cached tiles and idle handles of one image only
//! - Output variants of one image share a single decoded raster
//! - Invalid requests never reach the cache or the pool

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use viewpoint_server::error::TileError;
use viewpoint_server::tile::{
    CachedTile, Compression, ImageTileRequest, MapTileRequest, PoolConfig, TileCache,
    TileFactoryPool, TileFormat, TileMatrixSetRegistry, TileProvider, MAX_TILE_MATRIX,
};
use viewpoint_server::viewpoint::RangeAdjustment;

use super::test_utils::{gradient, CountingEngine};

struct Fixture {
    _dir: TempDir,
    engine: Arc<CountingEngine>,
    provider: TileProvider,
    first: Arc<str>,
    second: Arc<str>,
}

fn fixture(config: PoolConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.png");
    let second = dir.path().join("second.png");
    gradient(300, 200).save(&first).unwrap();
    gradient(100, 100).save(&second).unwrap();

    let engine = Arc::new(CountingEngine::new());
    let provider = TileProvider::new(
        Arc::new(TileCache::new()),
        TileFactoryPool::with_config(engine.clone(), config),
        Arc::new(TileMatrixSetRegistry::new()),
    );

    Fixture {
        engine,
        provider,
        first: Arc::from(first.to_string_lossy().as_ref()),
        second: Arc::from(second.to_string_lossy().as_ref()),
        _dir: dir,
    }
}

fn request(path: &Arc<str>, x: i64, y: i64) -> ImageTileRequest {
    ImageTileRequest {
        path: path.clone(),
        tile_size: 64,
        z: 0,
        x,
        y,
        format: TileFormat::Png,
        compression: Compression::None,
        range_adjustment: RangeAdjustment::None,
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_bounded_handles() {
    let f = fixture(PoolConfig {
        max_handles_per_key: 2,
        ..PoolConfig::default()
    });

    let mut tasks = Vec::new();
    for x in 0..4 {
        for y in 0..3 {
            let provider = f.provider.clone();
            let req = request(&f.first, x, y);
            tasks.push(tokio::spawn(async move { provider.get_image_tile(req).await }));
        }
    }

    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome.tile, CachedTile::Data(_)));
    }

    assert!(f.engine.opens() <= 2, "opened {} handles", f.engine.opens());
    let stats = f.provider.pool().stats();
    assert_eq!(stats.checked_out, 0);
    assert_eq!(stats.checkouts, 12);
}

#[tokio::test]
async fn test_busy_pool_is_retryable() {
    let f = fixture(PoolConfig {
        max_handles_per_key: 1,
        checkout_timeout: Duration::from_millis(20),
        ..PoolConfig::default()
    });

    let key = viewpoint_server::tile::FactoryKey::new(
        f.first.clone(),
        TileFormat::Png,
        Compression::None,
        RangeAdjustment::None,
    );
    let held = f.provider.pool().checkout(&key).await.unwrap();

    match f.provider.get_image_tile(request(&f.first, 0, 0)).await {
        Err(err @ TileError::PoolExhausted { .. }) => assert!(err.is_retryable()),
        other => panic!("Expected PoolExhausted, got {:?}", other),
    }

    drop(held);
    let outcome = f.provider.get_image_tile(request(&f.first, 0, 0)).await.unwrap();
    assert!(!outcome.cache_hit);
}

#[tokio::test]
async fn test_range_adjustment_is_part_of_the_tile_identity() {
    let f = fixture(PoolConfig::default());

    let plain = f.provider.get_image_tile(request(&f.first, 0, 0)).await.unwrap();
    let mut stretched_request = request(&f.first, 0, 0);
    stretched_request.range_adjustment = RangeAdjustment::Dra;
    let stretched = f.provider.get_image_tile(stretched_request).await.unwrap();

    assert!(!stretched.cache_hit);
    assert_eq!(f.engine.opens(), 2);
    assert_eq!(f.provider.cache().len().await, 2);

    match (plain.tile, stretched.tile) {
        (CachedTile::Data(a), CachedTile::Data(b)) => assert_ne!(a, b),
        other => panic!("Expected two rendered tiles, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalidate_path_is_scoped_to_one_image() {
    let f = fixture(PoolConfig::default());

    f.provider.get_image_tile(request(&f.first, 0, 0)).await.unwrap();
    f.provider.get_image_tile(request(&f.first, 1, 0)).await.unwrap();
    f.provider.get_image_tile(request(&f.second, 0, 0)).await.unwrap();
    assert_eq!(f.provider.cache().len().await, 3);

    f.provider.invalidate_path(&f.first).await;
    assert_eq!(f.provider.cache().len().await, 1);

    let again = f.provider.get_image_tile(request(&f.first, 0, 0)).await.unwrap();
    assert!(!again.cache_hit);
    let other = f.provider.get_image_tile(request(&f.second, 0, 0)).await.unwrap();
    assert!(other.cache_hit);

    // The first image needed a fresh handle, the second kept its own
    assert_eq!(f.engine.opens(), 3);
}

#[tokio::test]
async fn test_unreadable_image_is_reported_per_request() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.png");
    std::fs::write(&path, b"not an image").unwrap();

    let f = fixture(PoolConfig::default());
    let broken: Arc<str> = Arc::from(path.to_string_lossy().as_ref());

    for _ in 0..2 {
        match f.provider.get_image_tile(request(&broken, 0, 0)).await {
            Err(TileError::Unreadable { path }) => assert_eq!(path, broken.as_ref()),
            other => panic!("Expected Unreadable, got {:?}", other),
        }
    }

    // Failed opens leave no handle checked out and nothing cached
    let stats = f.provider.pool().stats();
    assert_eq!(stats.open_failures, 2);
    assert_eq!(stats.checked_out, 0);
    assert_eq!(f.provider.cache().len().await, 0);

    // Healthy images are unaffected
    assert!(f.provider.get_image_tile(request(&f.first, 0, 0)).await.is_ok());
}

fn map_request(
    path: &Arc<str>,
    tile_matrix_set: &str,
    tile_matrix: i64,
    invert_y: bool,
) -> MapTileRequest {
    MapTileRequest {
        path: path.clone(),
        tile_matrix_set: tile_matrix_set.to_string(),
        tile_matrix,
        tile_row: 0,
        tile_col: 0,
        invert_y,
        format: TileFormat::Png,
        compression: Compression::None,
        range_adjustment: RangeAdjustment::None,
    }
}

#[tokio::test]
async fn test_unencodable_compression_never_reaches_the_pool() {
    let f = fixture(PoolConfig::default());

    for compression in [Compression::Lzw, Compression::Deflate, Compression::J2k] {
        let mut req = request(&f.first, 0, 0);
        req.format = TileFormat::Gtiff;
        req.compression = compression;

        match f.provider.get_image_tile(req).await {
            Err(TileError::InvalidRequest { message }) => {
                assert!(message.contains(compression.as_str()))
            }
            other => panic!("Expected InvalidRequest, got {:?}", other),
        }
    }

    let stats = f.provider.pool().stats();
    assert_eq!(stats.opens, 0);
    assert_eq!(stats.checkouts, 0);
    assert_eq!(f.engine.opens(), 0);
    assert_eq!(f.engine.raster_stats().decodes, 0);
}

#[tokio::test]
async fn test_output_variants_share_one_decoded_raster() {
    let f = fixture(PoolConfig {
        max_handles_per_key: 2,
        ..PoolConfig::default()
    });

    f.provider.get_image_tile(request(&f.first, 0, 1)).await.unwrap();

    let mut tasks = Vec::new();
    for format in [TileFormat::Png, TileFormat::Jpeg, TileFormat::Gtiff] {
        for x in 0..3 {
            let provider = f.provider.clone();
            let mut req = request(&f.first, x, 0);
            req.format = format;
            tasks.push(tokio::spawn(async move { provider.get_image_tile(req).await }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Up to two handles per format, all reading the same pixels
    assert!(f.engine.opens() >= 3);
    let rasters = f.engine.raster_stats();
    assert_eq!(rasters.decodes, 1);
    assert_eq!(rasters.resident, 1);
    assert_eq!(rasters.resident_bytes, 300 * 200 * 3);
}

#[tokio::test]
async fn test_invalid_map_requests_leave_cache_untouched() {
    let f = fixture(PoolConfig::default());

    let invalid = [
        map_request(&f.first, "Mars", 0, false),
        map_request(&f.first, "WebMercatorQuad", -1, false),
        map_request(&f.first, "WebMercatorQuad", -1, true),
        map_request(&f.first, "WorldCRS84Quad", MAX_TILE_MATRIX + 1, false),
    ];
    for req in invalid {
        match f.provider.get_map_tile(req).await {
            Err(TileError::UnknownTileMatrixSet { .. }) | Err(TileError::InvalidRequest { .. }) => {}
            other => panic!("Expected a validation error, got {:?}", other),
        }
    }

    let cache = f.provider.cache();
    assert_eq!(cache.hits(), 0);
    assert_eq!(cache.misses(), 0);
    assert_eq!(cache.len().await, 0);
    assert_eq!(f.provider.pool().stats().checkouts, 0);
    assert_eq!(f.engine.opens(), 0);
}
