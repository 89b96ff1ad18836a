//! Test utilities for integration tests.
//!
//! [`TestApp`] wires the in-memory store and queue, a local object source
//! and the image engine the same way the binary wires the AWS backends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use tempfile::TempDir;
use tower::ServiceExt;

use viewpoint_server::error::{IoError, RenderError};
use viewpoint_server::io::{LocalObjectSource, ObjectSource};
use viewpoint_server::queue::{MemoryQueue, RequestQueue};
use viewpoint_server::server::{create_router, AppState, RouterConfig};
use viewpoint_server::tile::{
    FactoryKey, ImageInfo, ImageRasterEngine, RasterCacheStats, RasterEngine, TileCache,
    TileFactory, TileFactoryPool, TileMatrixSetRegistry, TileProvider,
};
use viewpoint_server::viewpoint::MemoryViewpointStore;
use viewpoint_server::worker::{ViewpointWorker, WorkerConfig, WorkerHandle};

pub const BUCKET: &str = "imagery";

// =============================================================================
// Counting Backends
// =============================================================================

/// Local object source that counts fetches.
pub struct CountingSource {
    inner: LocalObjectSource,
    fetches: AtomicUsize,
}

impl CountingSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalObjectSource::new(root),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectSource for CountingSource {
    async fn fetch_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<u64, IoError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_to(bucket, key, dest).await
    }
}

/// Image engine that counts opened handles.
pub struct CountingEngine {
    inner: ImageRasterEngine,
    opens: AtomicUsize,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self {
            inner: ImageRasterEngine::new(),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn raster_stats(&self) -> RasterCacheStats {
        self.inner.raster_stats()
    }
}

impl RasterEngine for CountingEngine {
    fn open(&self, key: &FactoryKey) -> Result<Box<dyn TileFactory>, RenderError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(key)
    }

    fn describe(&self, path: &Path) -> Result<ImageInfo, RenderError> {
        self.inner.describe(path)
    }

    fn evict(&self, path: &str) {
        self.inner.evict(path)
    }
}

// =============================================================================
// Test Application
// =============================================================================

pub struct TestApp {
    pub dir: TempDir,
    pub store: Arc<MemoryViewpointStore>,
    pub queue: Arc<MemoryQueue>,
    pub source: Arc<CountingSource>,
    pub engine: Arc<CountingEngine>,
    pub tiles: TileProvider,
    pub worker: ViewpointWorker,
}

impl TestApp {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("objects").join(BUCKET)).unwrap();

        let store = Arc::new(MemoryViewpointStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let source = Arc::new(CountingSource::new(dir.path().join("objects")));
        let engine = Arc::new(CountingEngine::new());

        let tiles = TileProvider::new(
            Arc::new(TileCache::new()),
            TileFactoryPool::new(engine.clone()),
            Arc::new(TileMatrixSetRegistry::new()),
        );
        let worker = build_worker(&dir, &store, &queue, &source, &engine);

        Self {
            dir,
            store,
            queue,
            source,
            engine,
            tiles,
            worker,
        }
    }

    /// A second worker over the same backends, for running the receive loop.
    pub fn spawn_worker(&self) -> WorkerHandle {
        build_worker(&self.dir, &self.store, &self.queue, &self.source, &self.engine).spawn()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Store a `width` x `height` RGB gradient under `key` in the test bucket.
    pub fn add_png(&self, key: &str, width: u32, height: u32) {
        let path = self.dir.path().join("objects").join(BUCKET).join(key);
        gradient(width, height).save(path).unwrap();
    }

    pub fn add_raw(&self, key: &str, data: &[u8]) {
        let path = self.dir.path().join("objects").join(BUCKET).join(key);
        std::fs::write(path, data).unwrap();
    }

    pub fn router(&self) -> Router {
        self.router_with(RouterConfig::new().with_tracing(false))
    }

    pub fn router_with(&self, config: RouterConfig) -> Router {
        let state = AppState::new(self.store.clone(), self.queue.clone(), self.tiles.clone());
        create_router(state, config)
    }

    /// Hand every queued request to the worker until the queue is empty.
    pub async fn drain_queue(&self) -> usize {
        let mut handled = 0;
        loop {
            let batch = self.queue.receive(10, Duration::ZERO).await.unwrap();
            if batch.is_empty() {
                return handled;
            }
            for message in batch {
                self.worker.handle(message).await;
                handled += 1;
            }
        }
    }

    /// Register `key` as viewpoint `id` through the API and prepare it.
    pub async fn ready_viewpoint(&self, id: &str, key: &str) {
        let body = serde_json::json!({
            "viewpoint_id": id,
            "viewpoint_name": format!("{} name", id),
            "bucket_name": BUCKET,
            "object_key": key,
        });
        let response = send(&self.router(), Method::POST, "/viewpoints", Some(body)).await;
        assert_eq!(response.status, StatusCode::CREATED);
        self.drain_queue().await;
    }
}

fn build_worker(
    dir: &TempDir,
    store: &Arc<MemoryViewpointStore>,
    queue: &Arc<MemoryQueue>,
    source: &Arc<CountingSource>,
    engine: &Arc<CountingEngine>,
) -> ViewpointWorker {
    ViewpointWorker::new(
        queue.clone(),
        store.clone(),
        source.clone(),
        engine.clone(),
        WorkerConfig::new(dir.path().join("cache"))
            .with_wait_time(Duration::from_millis(50))
            .with_error_backoff(Duration::from_millis(10)),
    )
}

// =============================================================================
// HTTP Helpers
// =============================================================================

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> TestResponse {
    send_with_headers(router, method, uri, body, &[]).await
}

pub async fn send_with_headers(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
    headers: &[(&str, &str)],
) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn get(router: &Router, uri: &str) -> TestResponse {
    send(router, Method::GET, uri, None).await
}

// =============================================================================
// Image Helpers
// =============================================================================

pub fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}

pub fn is_valid_png(data: &[u8]) -> bool {
    data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
}

pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0xFF && data[1] == 0xD8 && data.ends_with(&[0xFF, 0xD9])
}

pub fn is_valid_tiff(data: &[u8]) -> bool {
    data.starts_with(b"II*\0") || data.starts_with(b"MM\0*")
}
