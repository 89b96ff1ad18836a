//! Worker integration tests.
//!
//! Tests verify:
//! - The spawned worker drains the queue and stops on shutdown
//! - Redelivered requests are harmless
//! - Unreadable images fail their viewpoint without stopping the worker
//! - Records deleted while queued are skipped

use std::time::Duration;

use axum::http::{Method, StatusCode};
use serde_json::json;

use viewpoint_server::queue::{RequestQueue, ViewpointRequest};
use viewpoint_server::tile::{read_sidecar, PixelType};
use viewpoint_server::viewpoint::{
    ViewpointRecord, ViewpointStatus, ViewpointStore, ViewpointUpdate,
};
use viewpoint_server::worker::Disposition;

use super::test_utils::{get, send, TestApp, BUCKET};

async fn wait_for_status(app: &TestApp, id: &str, status: ViewpointStatus) -> bool {
    for _ in 0..200 {
        if matches!(app.store.get(id).await, Ok(record) if record.viewpoint_status == status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_spawned_worker_prepares_viewpoints() {
    let app = TestApp::new();
    app.add_png("a.png", 32, 32);
    app.add_png("b.png", 20, 10);
    let router = app.router();

    for (id, key) in [("vp-a", "a.png"), ("vp-b", "b.png")] {
        let response = send(
            &router,
            Method::POST,
            "/viewpoints",
            Some(json!({
                "viewpoint_id": id,
                "viewpoint_name": id,
                "bucket_name": BUCKET,
                "object_key": key,
                "tile_size": 256,
            })),
        )
        .await;
        assert_eq!(response.status, StatusCode::CREATED);
    }

    let handle = app.spawn_worker();

    assert!(wait_for_status(&app, "vp-a", ViewpointStatus::Ready).await);
    assert!(wait_for_status(&app, "vp-b", ViewpointStatus::Ready).await);
    assert!(handle.shutdown(Duration::from_secs(5)).await);

    assert!(app.queue.is_empty());
    let record = app.store.get("vp-b").await.unwrap();
    assert_eq!(record.tile_size, Some(256));

    let info = get(&router, "/viewpoints/vp-b/image/info").await.json();
    assert_eq!(info["width"], 20);
    assert_eq!(info["height"], 10);
}

#[tokio::test]
async fn test_redelivered_create_is_harmless() {
    let app = TestApp::new();
    app.add_png("a.png", 32, 32);
    app.ready_viewpoint("vp-1", "a.png").await;
    let first = app.store.get("vp-1").await.unwrap();

    // The same request delivered again after completion
    app.queue
        .enqueue(&ViewpointRequest::create("vp-1"))
        .await
        .unwrap();
    assert_eq!(app.drain_queue().await, 1);

    let second = app.store.get("vp-1").await.unwrap();
    assert_eq!(second.viewpoint_status, ViewpointStatus::Ready);
    assert_eq!(second.local_object_path, first.local_object_path);
    assert_eq!(second.tile_size, first.tile_size);
}

#[tokio::test]
async fn test_unreadable_image_fails_only_its_viewpoint() {
    let app = TestApp::new();
    app.add_raw("broken.png", b"definitely not a png");
    app.add_png("good.png", 16, 16);

    app.ready_viewpoint("vp-broken", "broken.png").await;
    app.ready_viewpoint("vp-good", "good.png").await;

    let broken = app.store.get("vp-broken").await.unwrap();
    assert_eq!(broken.viewpoint_status, ViewpointStatus::Failed);
    assert!(broken.error_message.is_some());

    let good = app.store.get("vp-good").await.unwrap();
    assert_eq!(good.viewpoint_status, ViewpointStatus::Ready);
}

#[tokio::test]
async fn test_viewpoint_deleted_while_queued_is_skipped() {
    let app = TestApp::new();
    app.add_png("a.png", 16, 16);
    app.store
        .create(ViewpointRecord::requested("vp-1", "one", BUCKET, "a.png"))
        .await
        .unwrap();
    app.queue
        .enqueue(&ViewpointRequest::create("vp-1"))
        .await
        .unwrap();
    app.store
        .update("vp-1", ViewpointUpdate::status(ViewpointStatus::Deleted))
        .await
        .unwrap();

    let batch = app.queue.receive(1, Duration::ZERO).await.unwrap();
    let disposition = app.worker.handle(batch.into_iter().next().unwrap()).await;

    assert_eq!(disposition, Disposition::Acknowledge);
    assert!(app.queue.is_empty());
    assert_eq!(app.source.fetches(), 0);
    assert_eq!(
        app.store.get("vp-1").await.unwrap().viewpoint_status,
        ViewpointStatus::Deleted
    );
}

#[tokio::test]
async fn test_sidecar_is_written_next_to_image() {
    let app = TestApp::new();
    app.add_png("a.png", 24, 12);
    app.ready_viewpoint("vp-1", "a.png").await;

    let record = app.store.get("vp-1").await.unwrap();
    let path = std::path::PathBuf::from(record.local_object_path.unwrap());
    assert!(path.starts_with(app.cache_dir().join("vp-1")));

    let info = read_sidecar(&path).await.unwrap();
    assert_eq!((info.width, info.height), (24, 12));
    assert_eq!(info.pixel_type, PixelType::Byte);
    assert_eq!(app.source.fetches(), 1);
}
