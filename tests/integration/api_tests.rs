//! API integration tests for viewpoint management and tile retrieval.
//!
//! Tests verify:
//! - Viewpoint create, list, describe, update and delete
//! - Status gating of image and map endpoints
//! - Pixel tiles in each output format, cache headers and empty tiles
//! - Image statistics, metadata, bounds and info
//! - Tile matrix set endpoints
//! - JSON error bodies and status codes
//! - Request ids on every response and through CORS

use axum::http::{Method, StatusCode};
use serde_json::json;

use viewpoint_server::queue::ViewpointRequest;
use viewpoint_server::RequestQueue;
use viewpoint_server::server::RouterConfig;
use viewpoint_server::viewpoint::{ViewpointStatus, ViewpointStore};

use super::test_utils::{
    get, is_valid_jpeg, is_valid_png, is_valid_tiff, send, send_with_headers, TestApp, BUCKET,
};

fn create_body(id: &str, key: &str) -> serde_json::Value {
    json!({
        "viewpoint_id": id,
        "viewpoint_name": "Harbour",
        "bucket_name": BUCKET,
        "object_key": key,
    })
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_ping() {
    let app = TestApp::new();
    let response = get(&app.router(), "/ping").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!({ "status": "OK" }));
}

// =============================================================================
// Request Correlation
// =============================================================================

#[tokio::test]
async fn test_caller_request_id_is_echoed() {
    let app = TestApp::new();

    // Traced and untraced routers both carry the id
    for router in [app.router(), app.router_with(RouterConfig::new())] {
        let response = send_with_headers(
            &router,
            Method::GET,
            "/viewpoints/missing",
            None,
            &[("x-request-id", "req-0042")],
        )
        .await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.header("x-request-id"), Some("req-0042"));
    }
}

#[tokio::test]
async fn test_request_id_is_generated_when_missing() {
    let app = TestApp::new();
    let router = app.router();

    let first = get(&router, "/ping").await;
    let second = get(&router, "/ping").await;

    let first_id = first.header("x-request-id").expect("request id");
    let second_id = second.header("x-request-id").expect("request id");
    assert_eq!(first_id.len(), 36);
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn test_request_id_is_allowed_and_exposed_over_cors() {
    let app = TestApp::new();
    let router = app.router();

    let preflight = send_with_headers(
        &router,
        Method::OPTIONS,
        "/viewpoints",
        None,
        &[
            ("origin", "https://viewer.example.com"),
            ("access-control-request-method", "GET"),
            ("access-control-request-headers", "x-request-id"),
        ],
    )
    .await;
    let allowed = preflight
        .header("access-control-allow-headers")
        .unwrap_or_default()
        .to_ascii_lowercase();
    assert!(allowed.contains("x-request-id"), "allowed headers: {}", allowed);

    let response = send_with_headers(
        &router,
        Method::GET,
        "/ping",
        None,
        &[("origin", "https://viewer.example.com")],
    )
    .await;
    let exposed = response
        .header("access-control-expose-headers")
        .unwrap_or_default()
        .to_ascii_lowercase();
    assert!(exposed.contains("x-request-id"), "exposed headers: {}", exposed);
}

// =============================================================================
// Viewpoint Management
// =============================================================================

#[tokio::test]
async fn test_create_viewpoint_is_requested_and_queued() {
    let app = TestApp::new();
    let response = send(
        &app.router(),
        Method::POST,
        "/viewpoints",
        Some(create_body("vp-1", "harbour.png")),
    )
    .await;

    assert_eq!(response.status, StatusCode::CREATED);
    let record = response.json();
    assert_eq!(record["viewpoint_id"], "vp-1");
    assert_eq!(record["viewpoint_status"], "REQUESTED");
    assert_eq!(record["range_adjustment"], "NONE");

    assert_eq!(app.queue.len(), 1);
    let batch = app
        .queue
        .receive(1, std::time::Duration::ZERO)
        .await
        .unwrap();
    let request = ViewpointRequest::decode(&batch[0].body).unwrap();
    assert_eq!(request, ViewpointRequest::create("vp-1"));
}

#[tokio::test]
async fn test_create_rejects_invalid_viewpoint_id() {
    let app = TestApp::new();
    let response = send(
        &app.router(),
        Method::POST,
        "/viewpoints",
        Some(create_body("has space", "harbour.png")),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    let error = response.json();
    assert_eq!(error["error"], "validation_error");
    assert_eq!(
        error["message"],
        "Invalid viewpoint_id: must not contain whitespace and be URL safe."
    );
    assert_eq!(error["status"], 422);
    assert!(app.queue.is_empty());
}

#[tokio::test]
async fn test_create_rejects_missing_fields() {
    let app = TestApp::new();
    let response = send(
        &app.router(),
        Method::POST,
        "/viewpoints",
        Some(json!({ "viewpoint_id": "vp-1" })),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json()["error"], "validation_error");
}

#[tokio::test]
async fn test_create_rejects_zero_tile_size() {
    let app = TestApp::new();
    let mut body = create_body("vp-1", "harbour.png");
    body["tile_size"] = json!(0);

    let response = send(&app.router(), Method::POST, "/viewpoints", Some(body)).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_create_duplicate_is_conflict() {
    let app = TestApp::new();
    let router = app.router();
    let first = send(&router, Method::POST, "/viewpoints", Some(create_body("vp-1", "a.png"))).await;
    assert_eq!(first.status, StatusCode::CREATED);

    let second =
        send(&router, Method::POST, "/viewpoints", Some(create_body("vp-1", "b.png"))).await;
    assert_eq!(second.status, StatusCode::CONFLICT);
    assert_eq!(app.queue.len(), 1);
}

#[tokio::test]
async fn test_describe_unknown_viewpoint() {
    let app = TestApp::new();
    let response = get(&app.router(), "/viewpoints/missing").await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["message"], "viewpoint_id missing not found.");
}

#[tokio::test]
async fn test_list_viewpoints() {
    let app = TestApp::new();
    let router = app.router();
    for id in ["vp-1", "vp-2"] {
        send(&router, Method::POST, "/viewpoints", Some(create_body(id, "a.png"))).await;
    }

    let response = get(&router, "/viewpoints").await;
    assert_eq!(response.status, StatusCode::OK);
    let items = response.json()["items"].as_array().unwrap().clone();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_viewpoint_becomes_ready() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;

    let record = get(&app.router(), "/viewpoints/vp-1").await.json();
    assert_eq!(record["viewpoint_status"], "READY");
    assert_eq!(record["tile_size"], 512);
    assert!(record["local_object_path"]
        .as_str()
        .unwrap()
        .ends_with("harbour.png"));
    assert!(record.get("error_message").is_none());
}

#[tokio::test]
async fn test_missing_object_fails_viewpoint() {
    let app = TestApp::new();
    app.ready_viewpoint("vp-1", "nowhere.png").await;

    let record = get(&app.router(), "/viewpoints/vp-1").await.json();
    assert_eq!(record["viewpoint_status"], "FAILED");
    assert!(record["error_message"].as_str().is_some());

    let tile = get(&app.router(), "/viewpoints/vp-1/image/tiles/0/0/0.png").await;
    assert_eq!(tile.status, StatusCode::CONFLICT);
    assert_eq!(tile.json()["error"], "not_ready");
}

#[tokio::test]
async fn test_update_viewpoint() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;

    let response = send(
        &app.router(),
        Method::PUT,
        "/viewpoints",
        Some(json!({
            "viewpoint_id": "vp-1",
            "viewpoint_name": "Renamed",
            "tile_size": 256,
            "range_adjustment": "MINMAX",
        })),
    )
    .await;

    assert_eq!(response.status, StatusCode::CREATED);
    let record = response.json();
    assert_eq!(record["viewpoint_name"], "Renamed");
    assert_eq!(record["tile_size"], 256);
    assert_eq!(record["range_adjustment"], "MINMAX");
    assert_eq!(record["viewpoint_status"], "READY");
    assert_eq!(app.queue.len(), 1);

    assert_eq!(app.drain_queue().await, 1);
    let stored = app.store.get("vp-1").await.unwrap();
    assert_eq!(stored.viewpoint_status, ViewpointStatus::Ready);
    assert_eq!(stored.tile_size, Some(256));
}

#[tokio::test]
async fn test_update_of_failed_viewpoint_queues_nothing() {
    let app = TestApp::new();
    app.ready_viewpoint("vp-1", "nowhere.png").await;
    assert!(app.queue.is_empty());

    let response = send(
        &app.router(),
        Method::PUT,
        "/viewpoints",
        Some(json!({ "viewpoint_id": "vp-1", "viewpoint_name": "Renamed" })),
    )
    .await;

    assert_eq!(response.status, StatusCode::CREATED);
    let record = response.json();
    assert_eq!(record["viewpoint_name"], "Renamed");
    assert_eq!(record["viewpoint_status"], "FAILED");
    assert!(app.queue.is_empty());
}

#[tokio::test]
async fn test_update_requires_viewpoint_id() {
    let app = TestApp::new();
    let response = send(
        &app.router(),
        Method::PUT,
        "/viewpoints",
        Some(json!({ "viewpoint_name": "Renamed" })),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_delete_viewpoint() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    // Warm the tile cache first
    let tile = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.png").await;
    assert_eq!(tile.status, StatusCode::OK);
    assert!(app.tiles.cache().len().await > 0);

    let response = send(&router, Method::DELETE, "/viewpoints/vp-1", None).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());

    let record = get(&router, "/viewpoints/vp-1").await.json();
    assert_eq!(record["viewpoint_status"], "DELETED");
    assert!(app.tiles.cache().is_empty().await);
    assert!(!app.cache_dir().join("vp-1").exists());

    let tile = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.png").await;
    assert_eq!(tile.status, StatusCode::NOT_FOUND);
    assert_eq!(
        tile.json()["message"],
        "Cannot view TILE for this image since this has already been deleted."
    );

    let again = send(&router, Method::DELETE, "/viewpoints/vp-1", None).await;
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(again.json()["message"], "viewpoint_id vp-1 not found.");

    let update = send(
        &router,
        Method::PUT,
        "/viewpoints",
        Some(json!({ "viewpoint_id": "vp-1", "viewpoint_name": "Back" })),
    )
    .await;
    assert_eq!(update.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_unknown_viewpoint() {
    let app = TestApp::new();
    let response = send(&app.router(), Method::DELETE, "/viewpoints/ghost", None).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Pixel Tiles
// =============================================================================

#[tokio::test]
async fn test_image_tile_png() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;

    let response = get(&app.router(), "/viewpoints/vp-1/image/tiles/0/0/0.png").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("image/png"));
    assert_eq!(response.header("cache-control"), Some("private, max-age=3600"));
    assert_eq!(response.header("x-tile-cache-hit"), Some("false"));
    assert!(is_valid_png(&response.body));

    let tile = image::load_from_memory(&response.body).unwrap();
    assert_eq!((tile.width(), tile.height()), (512, 512));
}

#[tokio::test]
async fn test_image_tile_is_cached() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let first = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.png").await;
    let second = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.png").await;

    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.header("x-tile-cache-hit"), Some("true"));
    assert_eq!(first.body, second.body);
    assert_eq!(app.engine.opens(), 1);
}

#[tokio::test]
async fn test_image_tile_jpeg_and_tiff() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let jpeg = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.jpeg?compression=JPEG").await;
    assert_eq!(jpeg.status, StatusCode::OK);
    assert_eq!(jpeg.header("content-type"), Some("image/jpeg"));
    assert!(is_valid_jpeg(&jpeg.body));

    let tiff = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.gtiff").await;
    assert_eq!(tiff.status, StatusCode::OK);
    assert_eq!(tiff.header("content-type"), Some("image/tiff"));
    assert!(is_valid_tiff(&tiff.body));

    // Distinct variants open distinct handles
    assert_eq!(app.engine.opens(), 2);
}

#[tokio::test]
async fn test_image_tile_outside_image_has_no_content() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let response = get(&router, "/viewpoints/vp-1/image/tiles/0/3/3.png").await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());

    // Empty tiles are cached too
    let again = get(&router, "/viewpoints/vp-1/image/tiles/0/3/3.png").await;
    assert_eq!(again.status, StatusCode::NO_CONTENT);
    assert_eq!(again.header("x-tile-cache-hit"), Some("true"));
}

#[tokio::test]
async fn test_image_tile_rejects_bad_parameters() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let negative = get(&router, "/viewpoints/vp-1/image/tiles/-1/0/0.png").await;
    assert_eq!(negative.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        negative.json()["message"],
        "Resolution Level for get tile request must be >= 0. Requested z=-1"
    );

    for uri in [
        "/viewpoints/vp-1/image/tiles/0/0/0.bmp",
        "/viewpoints/vp-1/image/tiles/0/0/zero.png",
        "/viewpoints/vp-1/image/tiles/0/x/0.png",
        "/viewpoints/vp-1/image/tiles/0/0/0.png?compression=ZSTD",
        "/viewpoints/vp-1/image/tiles/0/0/0.png?compression=JPEG",
    ] {
        let response = get(&router, uri).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(response.json()["error"], "invalid_request", "{}", uri);
    }

    // Validation never touches the render pool
    assert_eq!(app.engine.opens(), 0);
}

#[tokio::test]
async fn test_tile_of_requested_viewpoint_is_not_ready() {
    let app = TestApp::new();
    let router = app.router();
    send(&router, Method::POST, "/viewpoints", Some(create_body("vp-1", "a.png"))).await;

    let response = get(&router, "/viewpoints/vp-1/image/tiles/0/0/0.png").await;
    assert_eq!(response.status, StatusCode::CONFLICT);

    let unknown = get(&router, "/viewpoints/other/image/tiles/0/0/0.png").await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Image Facts
// =============================================================================

#[tokio::test]
async fn test_image_statistics() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;

    let response = get(&app.router(), "/viewpoints/vp-1/image/statistics").await;
    assert_eq!(response.status, StatusCode::OK);

    let stats = &response.json()["image_statistics"];
    assert_eq!(stats["size"], json!([64, 48]));
    assert!(stats["geoTransform"].is_null());
    assert_eq!(stats["cornerCoordinates"]["lowerRight"], json!([64.0, 48.0]));

    let bands = stats["bands"].as_array().unwrap();
    assert_eq!(bands.len(), 3);
    assert_eq!(bands[0]["band"], 1);
    assert_eq!(bands[0]["type"], "Byte");
    assert_eq!(bands[0]["minimum"], 0.0);
    let maximum = bands[0]["maximum"].as_f64().unwrap();
    assert!((maximum - 63.0).abs() < 1e-6, "maximum was {}", maximum);
}

#[tokio::test]
async fn test_image_metadata_bounds_and_info() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let metadata = get(&router, "/viewpoints/vp-1/image/metadata").await;
    assert_eq!(metadata.status, StatusCode::OK);
    assert!(metadata.json()["metadata"].is_object());

    let bounds = get(&router, "/viewpoints/vp-1/image/bounds").await;
    assert_eq!(bounds.json(), json!({ "bounds": [0.0, 0.0, 64.0, 48.0] }));

    let info = get(&router, "/viewpoints/vp-1/image/info").await.json();
    assert_eq!(info["viewpoint_id"], "vp-1");
    assert_eq!(info["width"], 64);
    assert_eq!(info["height"], 48);
    assert_eq!(info["band_count"], 3);
    assert_eq!(info["pixel_type"], "Byte");
    assert_eq!(info["tile_size"], 512);
}

#[tokio::test]
async fn test_image_facts_of_deleted_viewpoint() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();
    send(&router, Method::DELETE, "/viewpoints/vp-1", None).await;

    for (api, uri) in [
        ("STATISTICS", "/viewpoints/vp-1/image/statistics"),
        ("METADATA", "/viewpoints/vp-1/image/metadata"),
        ("BOUNDS", "/viewpoints/vp-1/image/bounds"),
        ("INFO", "/viewpoints/vp-1/image/info"),
    ] {
        let response = get(&router, uri).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(
            response.json()["message"],
            format!(
                "Cannot view {} for this image since this has already been deleted.",
                api
            )
        );
    }
}

// =============================================================================
// Map Tiles
// =============================================================================

#[tokio::test]
async fn test_map_tile_sets() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let sets = get(&router, "/viewpoints/vp-1/map/tiles").await.json();
    let ids: Vec<_> = sets["tilesets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["WebMercatorQuad", "WorldCRS84Quad"]);

    let set = get(&router, "/viewpoints/vp-1/map/tiles/WorldCRS84Quad").await;
    assert_eq!(set.status, StatusCode::OK);
    assert_eq!(set.json()["matrixZeroSize"], json!([2, 1]));

    let unknown = get(&router, "/viewpoints/vp-1/map/tiles/UTM33").await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
    assert_eq!(unknown.json()["message"], "Unsupported tile set: UTM33");
}

#[tokio::test]
async fn test_map_tile_of_plain_raster_has_no_content() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    let response = get(&router, "/viewpoints/vp-1/map/tiles/WebMercatorQuad/1/0/1.png").await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    let inverted = get(
        &router,
        "/viewpoints/vp-1/map/tiles/WebMercatorQuad/1/1/1.png?invert_y=true",
    )
    .await;
    assert_eq!(inverted.status, StatusCode::NO_CONTENT);
    // Row 1 counted from the bottom of matrix 1 is row 0 from the top
    assert_eq!(inverted.header("x-tile-cache-hit"), Some("true"));
}

#[tokio::test]
async fn test_map_tile_rejects_out_of_range_address() {
    let app = TestApp::new();
    app.add_png("harbour.png", 64, 48);
    app.ready_viewpoint("vp-1", "harbour.png").await;
    let router = app.router();

    for uri in [
        "/viewpoints/vp-1/map/tiles/WebMercatorQuad/1/2/0.png",
        "/viewpoints/vp-1/map/tiles/WebMercatorQuad/31/0/0.png",
        "/viewpoints/vp-1/map/tiles/WebMercatorQuad/0/0/0.png?invert_y=maybe",
        "/viewpoints/vp-1/map/tiles/Unknown/0/0/0.png",
    ] {
        let response = get(&router, uri).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{}", uri);
    }
}
