//! Router configuration for the viewpoint server.
//!
//! # Route Structure
//!
//! ```text
//! /ping                                                   - Health check
//! /viewpoints                                             - Create, list, update
//! /viewpoints/{viewpoint_id}                              - Describe, delete
//! /viewpoints/{viewpoint_id}/image/tiles/{z}/{x}/{y}.{f}  - Pixel tiles
//! /viewpoints/{viewpoint_id}/image/{statistics,metadata,bounds,info}
//! /viewpoints/{viewpoint_id}/map/tiles[/{tms}[/{m}/{row}/{col}.{f}]]
//! ```
//!
//! # Example
//!
//! ```ignore
//! use viewpoint_server::server::{create_router, AppState, RouterConfig};
//!
//! let state = AppState::new(store, queue, tiles);
//! let config = RouterConfig::new()
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(state, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::time::Duration;

use axum::{body::Body, routing::get, Router};
use http::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use super::handlers::{
    create_viewpoint_handler, delete_viewpoint_handler, describe_viewpoint_handler,
    image_bounds_handler, image_info_handler, image_metadata_handler, image_statistics_handler,
    image_tile_handler, list_viewpoints_handler, map_tile_handler, map_tile_set_handler,
    map_tile_sets_handler, ping_handler, update_viewpoint_handler, AppState,
    DEFAULT_CACHE_MAX_AGE,
};

/// Header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl RouterConfig {
    /// Any CORS origin, 1 hour max-age, tracing enabled.
    pub fn new() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
            enable_tracing: true,
        }
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the application router.
///
/// The router's cache max-age overrides the one carried by `state`. Every
/// response carries an `X-Request-ID`: the caller's own, or a fresh UUID.
pub fn create_router(state: AppState, config: RouterConfig) -> Router {
    let state = state.with_cache_max_age(config.cache_max_age);
    let cors = build_cors_layer(&config);

    let router = Router::new()
        .route("/ping", get(ping_handler))
        .route(
            "/viewpoints",
            get(list_viewpoints_handler)
                .post(create_viewpoint_handler)
                .put(update_viewpoint_handler),
        )
        .route(
            "/viewpoints/{viewpoint_id}",
            get(describe_viewpoint_handler).delete(delete_viewpoint_handler),
        )
        // {filename} captures "{y}.{format}" as one segment
        .route(
            "/viewpoints/{viewpoint_id}/image/tiles/{z}/{x}/{filename}",
            get(image_tile_handler),
        )
        .route(
            "/viewpoints/{viewpoint_id}/image/statistics",
            get(image_statistics_handler),
        )
        .route(
            "/viewpoints/{viewpoint_id}/image/metadata",
            get(image_metadata_handler),
        )
        .route(
            "/viewpoints/{viewpoint_id}/image/bounds",
            get(image_bounds_handler),
        )
        .route("/viewpoints/{viewpoint_id}/image/info", get(image_info_handler))
        .route("/viewpoints/{viewpoint_id}/map/tiles", get(map_tile_sets_handler))
        .route(
            "/viewpoints/{viewpoint_id}/map/tiles/{tile_matrix_set}",
            get(map_tile_set_handler),
        )
        .route(
            "/viewpoints/{viewpoint_id}/map/tiles/{tile_matrix_set}/{tile_matrix}/{tile_row}/{filename}",
            get(map_tile_handler),
        )
        .with_state(state)
        .layer(cors);

    // Layers added last run first: the id is assigned, then traced, then
    // copied onto the response.
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let router = router.layer(PropagateRequestIdLayer::new(request_id.clone()));
    let router = if config.enable_tracing {
        router.layer(TraceLayer::new_for_http().make_span_with(request_span))
    } else {
        router
    };
    router.layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

/// Span for one request, carrying its correlation id.
fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    tracing::info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = %request_id,
    )
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .max_age(Duration::from_secs(86400)); // 24 hours

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        // No origins allowed
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
