//! HTTP request handlers for the viewpoint API.
//!
//! # Endpoints
//!
//! - `GET /ping` - Health check
//! - `POST /viewpoints`, `GET /viewpoints`, `PUT /viewpoints` - Manage viewpoints
//! - `GET|DELETE /viewpoints/{viewpoint_id}` - Describe or delete a viewpoint
//! - `GET /viewpoints/{viewpoint_id}/image/...` - Pixel tiles and image facts
//! - `GET /viewpoints/{viewpoint_id}/map/tiles/...` - Tile matrix set tiles

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{IoError, QueueError, RenderError, StoreError, TileError};
use crate::queue::{RequestQueue, ViewpointRequest};
use crate::tile::{
    read_sidecar, CachedTile, Compression, ImageInfo, ImageTileRequest, MapTileRequest,
    PixelType, TileFormat, TileMatrixSet, TileOutcome, TileProvider,
};
use crate::viewpoint::{
    is_valid_viewpoint_id, RangeAdjustment, Unavailable, ViewpointApi, ViewpointRecord,
    ViewpointStatus, ViewpointStore, ViewpointUpdate,
};

/// Default Cache-Control max-age for tiles, in seconds.
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState {
    /// Viewpoint records
    pub store: Arc<dyn ViewpointStore>,

    /// Queue feeding the viewpoint worker
    pub queue: Arc<dyn RequestQueue>,

    /// Tile rendering and caching
    pub tiles: TileProvider,

    /// Cache-Control max-age for tile responses
    pub cache_max_age: u32,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ViewpointStore>,
        queue: Arc<dyn RequestQueue>,
        tiles: TileProvider,
    ) -> Self {
        Self {
            store,
            queue,
            tiles,
            cache_max_age: DEFAULT_CACHE_MAX_AGE,
        }
    }

    pub fn with_cache_max_age(mut self, cache_max_age: u32) -> Self {
        self.cache_max_age = cache_max_age;
        self
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            tiles: self.tiles.clone(),
            cache_max_age: self.cache_max_age,
        }
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Body of `POST /viewpoints`.
#[derive(Debug, Deserialize)]
pub struct CreateViewpointRequest {
    pub viewpoint_id: String,
    pub viewpoint_name: String,
    pub bucket_name: String,
    pub object_key: String,
    #[serde(default)]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub range_adjustment: RangeAdjustment,
}

/// Body of `PUT /viewpoints`. Unset fields are left untouched.
#[derive(Debug, Deserialize)]
pub struct UpdateViewpointRequest {
    pub viewpoint_id: String,
    #[serde(default)]
    pub viewpoint_name: Option<String>,
    #[serde(default)]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub range_adjustment: Option<RangeAdjustment>,
}

/// Query parameters for tile requests.
#[derive(Debug, Default, Deserialize)]
pub struct TileQueryParams {
    /// Output compression (defaults to NONE)
    #[serde(default)]
    pub compression: Option<String>,

    /// Count map tile rows from the bottom
    #[serde(default)]
    pub invert_y: bool,
}

/// Split a `{coordinate}.{format}` path segment.
pub fn parse_tile_filename(filename: &str) -> Result<(i64, TileFormat), ApiError> {
    let (coordinate, extension) = filename.rsplit_once('.').ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Tile path segment {} must look like <coordinate>.<format>",
            filename
        ))
    })?;
    let format = TileFormat::parse(extension)
        .ok_or_else(|| ApiError::BadRequest(format!("Unsupported tile format: {}", extension)))?;
    Ok((parse_coordinate("y", coordinate)?, format))
}

fn parse_coordinate(name: &str, value: &str) -> Result<i64, ApiError> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {} coordinate: {}", name, value)))
}

fn parse_compression(value: Option<&str>) -> Result<Compression, ApiError> {
    match value {
        None => Ok(Compression::None),
        Some(value) => Compression::parse(value)
            .ok_or_else(|| ApiError::BadRequest(format!("Unsupported compression: {}", value))),
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "invalid_request")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Response of `GET /viewpoints`.
#[derive(Debug, Serialize)]
pub struct ViewpointListResponse {
    pub items: Vec<ViewpointRecord>,
}

/// Response of `GET /viewpoints/{viewpoint_id}/image/info`.
#[derive(Debug, Serialize)]
pub struct ImageInfoResponse {
    pub viewpoint_id: String,
    pub width: u64,
    pub height: u64,
    pub band_count: u32,
    pub pixel_type: PixelType,
    pub tile_size: Option<u32>,
}

/// One entry of `GET /viewpoints/{viewpoint_id}/map/tiles`.
#[derive(Debug, Serialize)]
pub struct TileSetSummary {
    pub id: &'static str,
    pub title: &'static str,
    pub crs: &'static str,
}

impl From<&TileMatrixSet> for TileSetSummary {
    fn from(set: &TileMatrixSet) -> Self {
        Self {
            id: set.id,
            title: set.title,
            crs: set.crs,
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed path or query parameters
    #[error("{0}")]
    BadRequest(String),

    /// Malformed or invalid request body
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The viewpoint exists but cannot serve the request yet
    #[error("{message}")]
    NotReady {
        status: ViewpointStatus,
        message: String,
    },

    #[error("{0}")]
    Conflict(String),

    /// A dependency is temporarily unavailable
    #[error("{0}")]
    Unavailable(String),

    /// Details are logged, never returned to the client
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn not_found(viewpoint_id: &str) -> Self {
        ApiError::NotFound(format!("viewpoint_id {} not found.", viewpoint_id))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::not_found(&id),
            StoreError::Conflict(message) => ApiError::Conflict(message),
            StoreError::Transient(message) => ApiError::Unavailable(message),
            StoreError::Fatal(message) => ApiError::Internal(message),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Unavailable(format!("Unable to queue viewpoint request: {}", err))
    }
}

impl From<Unavailable> for ApiError {
    fn from(err: Unavailable) -> Self {
        match err {
            Unavailable::Deleted { .. } => ApiError::NotFound(err.to_string()),
            Unavailable::NotReady { status, .. } => ApiError::NotReady {
                status,
                message: err.to_string(),
            },
        }
    }
}

impl From<TileError> for ApiError {
    fn from(err: TileError) -> Self {
        match err {
            TileError::InvalidRequest { message } => ApiError::BadRequest(message),
            TileError::UnknownTileMatrixSet { .. } => ApiError::BadRequest(err.to_string()),
            TileError::Render(RenderError::Unsupported(message)) => ApiError::BadRequest(message),
            TileError::PoolExhausted { .. } => ApiError::Unavailable(err.to_string()),
            TileError::Unreadable { .. } | TileError::Render(_) | TileError::TaskFailed(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<IoError> for ApiError {
    fn from(err: IoError) -> Self {
        ApiError::Internal(format!("Unable to read image statistics: {}", err))
    }
}

/// Convert ApiError to HTTP response.
///
/// 5xx errors are logged at ERROR, 404s at DEBUG and other 4xx at WARN.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::NotReady { .. } => (StatusCode::CONFLICT, "not_ready"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let detail = self.to_string();

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                "Server error: {}",
                detail
            );
        } else if status == StatusCode::NOT_FOUND {
            debug!(
                error_type = error_type,
                status = status.as_u16(),
                "Resource not found: {}",
                detail
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                detail
            );
        }

        let message = match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        let error_response = ErrorResponse::with_status(error_type, message, status);

        (status, Json(error_response)).into_response()
    }
}

// =============================================================================
// Viewpoint Handlers
// =============================================================================

/// Health check.
pub async fn ping_handler() -> impl IntoResponse {
    Json(json!({ "status": "OK" }))
}

/// Register a viewpoint and queue its preparation.
pub async fn create_viewpoint_handler(
    State(state): State<AppState>,
    body: Result<Json<CreateViewpointRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;

    if !is_valid_viewpoint_id(&body.viewpoint_id) {
        return Err(ApiError::Validation(
            "Invalid viewpoint_id: must not contain whitespace and be URL safe.".to_string(),
        ));
    }
    for (field, value) in [
        ("viewpoint_name", &body.viewpoint_name),
        ("bucket_name", &body.bucket_name),
        ("object_key", &body.object_key),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::Validation(format!("{} must not be empty.", field)));
        }
    }
    validate_tile_size(body.tile_size)?;

    let record = ViewpointRecord::requested(
        body.viewpoint_id,
        body.viewpoint_name,
        body.bucket_name,
        body.object_key,
    )
    .with_tile_size(body.tile_size)
    .with_range_adjustment(body.range_adjustment);

    let record = state.store.create(record).await?;
    state
        .queue
        .enqueue(&ViewpointRequest::create(record.viewpoint_id.clone()))
        .await?;

    info!(viewpoint_id = %record.viewpoint_id, "Viewpoint requested");
    Ok((StatusCode::CREATED, Json(record)))
}

/// List every viewpoint.
pub async fn list_viewpoints_handler(
    State(state): State<AppState>,
) -> Result<Json<ViewpointListResponse>, ApiError> {
    let items = state.store.list().await?;
    Ok(Json(ViewpointListResponse { items }))
}

/// Update the mutable fields of a viewpoint and queue a refresh.
///
/// A FAILED viewpoint only has its fields edited: the worker never picks a
/// failed image up again, so no refresh is queued for it.
pub async fn update_viewpoint_handler(
    State(state): State<AppState>,
    body: Result<Json<UpdateViewpointRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    validate_tile_size(body.tile_size)?;
    if let Some(name) = &body.viewpoint_name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation(
                "viewpoint_name must not be empty.".to_string(),
            ));
        }
    }

    let current = state.store.get(&body.viewpoint_id).await?;
    current.ensure_available(ViewpointApi::Update)?;

    let mut update = ViewpointUpdate::new();
    if let Some(name) = body.viewpoint_name {
        update = update.with_name(name);
    }
    if let Some(tile_size) = body.tile_size {
        update = update.with_tile_size(tile_size);
    }
    if let Some(range_adjustment) = body.range_adjustment {
        update = update.with_range_adjustment(range_adjustment);
    }

    let record = state.store.update(&body.viewpoint_id, update).await?;
    if record.viewpoint_status == ViewpointStatus::Failed {
        debug!(viewpoint_id = %record.viewpoint_id, "Viewpoint failed; refresh not queued");
    } else {
        state
            .queue
            .enqueue(&ViewpointRequest::update(record.viewpoint_id.clone()))
            .await?;
    }

    // Cached tiles may reflect the previous tile size or range adjustment
    if let Some(path) = &record.local_object_path {
        state.tiles.invalidate_path(path).await;
    }

    info!(viewpoint_id = %record.viewpoint_id, "Viewpoint updated");
    Ok((StatusCode::CREATED, Json(record)))
}

/// Describe one viewpoint.
pub async fn describe_viewpoint_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<Json<ViewpointRecord>, ApiError> {
    Ok(Json(state.store.get(&viewpoint_id).await?))
}

/// Soft-delete a viewpoint and release its local resources.
pub async fn delete_viewpoint_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let current = state.store.get(&viewpoint_id).await?;
    if current.viewpoint_status == ViewpointStatus::Deleted {
        return Err(ApiError::not_found(&viewpoint_id));
    }

    let record = state
        .store
        .update(
            &viewpoint_id,
            ViewpointUpdate::status(ViewpointStatus::Deleted),
        )
        .await
        .map_err(|err| match err {
            // Lost a race with another delete
            StoreError::Conflict(_) => ApiError::not_found(&viewpoint_id),
            other => other.into(),
        })?;

    if let Some(path) = &record.local_object_path {
        state.tiles.invalidate_path(path).await;
        remove_local_copy(FsPath::new(path)).await;
    }

    info!(viewpoint_id = %viewpoint_id, "Viewpoint deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn validate_tile_size(tile_size: Option<u32>) -> Result<(), ApiError> {
    match tile_size {
        Some(0) => Err(ApiError::Validation(
            "tile_size must be greater than 0.".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Remove the directory holding a fetched image and its sidecar.
async fn remove_local_copy(path: &FsPath) {
    let Some(dir) = path.parent() else {
        return;
    };
    if let Err(err) = tokio::fs::remove_dir_all(dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %err, "Failed to remove local image copy");
        }
    }
}

// =============================================================================
// Image Handlers
// =============================================================================

/// Fetch a record that must be READY for `api`, with its local image path.
async fn ready_viewpoint(
    state: &AppState,
    viewpoint_id: &str,
    api: ViewpointApi,
) -> Result<(ViewpointRecord, PathBuf), ApiError> {
    let record = state.store.get(viewpoint_id).await?;
    record.ensure_available(api)?;
    let path = record.local_object_path.clone().ok_or_else(|| {
        ApiError::Internal(format!("viewpoint {} is READY without a local image", viewpoint_id))
    })?;
    Ok((record, PathBuf::from(path)))
}

async fn image_info(
    state: &AppState,
    viewpoint_id: &str,
    api: ViewpointApi,
) -> Result<(ViewpointRecord, ImageInfo), ApiError> {
    let (record, path) = ready_viewpoint(state, viewpoint_id, api).await?;
    let info = read_sidecar(&path).await?;
    Ok((record, info))
}

/// Serve a pixel tile.
///
/// # Path Parameters
///
/// - `viewpoint_id`: Viewpoint identifier
/// - `z`: Resolution level (0 = full resolution)
/// - `x`: Tile column
/// - `filename`: `{y}.{format}` with format one of png, jpeg, jpg, gtiff, tif
///
/// # Query Parameters
///
/// - `compression`: NONE, DEFLATE, JPEG, LZW or J2K
pub async fn image_tile_handler(
    State(state): State<AppState>,
    Path((viewpoint_id, z, x, filename)): Path<(String, String, String, String)>,
    query: Result<Query<TileQueryParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let z = parse_coordinate("z", &z)?;
    let x = parse_coordinate("x", &x)?;
    let (y, format) = parse_tile_filename(&filename)?;
    let compression = parse_compression(query.compression.as_deref())?;

    let (record, path) = ready_viewpoint(&state, &viewpoint_id, ViewpointApi::Tile).await?;
    let tile_size = record
        .tile_size
        .ok_or_else(|| ApiError::Internal(format!("viewpoint {} has no tile size", viewpoint_id)))?;

    let request = ImageTileRequest {
        path: Arc::from(path.to_string_lossy().as_ref()),
        tile_size,
        z,
        x,
        y,
        format,
        compression,
        range_adjustment: record.range_adjustment,
    };
    let outcome = state.tiles.get_image_tile(request).await?;

    Ok(tile_response(outcome, format, state.cache_max_age))
}

/// Image statistics computed when the viewpoint was prepared.
pub async fn image_statistics_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, info) = image_info(&state, &viewpoint_id, ViewpointApi::Statistics).await?;
    Ok(Json(json!({ "image_statistics": info.statistics() })))
}

pub async fn image_metadata_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, info) = image_info(&state, &viewpoint_id, ViewpointApi::Metadata).await?;
    Ok(Json(json!({ "metadata": info.metadata })))
}

pub async fn image_bounds_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, info) = image_info(&state, &viewpoint_id, ViewpointApi::Bounds).await?;
    Ok(Json(json!({ "bounds": info.bounds() })))
}

pub async fn image_info_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<Json<ImageInfoResponse>, ApiError> {
    let (record, info) = image_info(&state, &viewpoint_id, ViewpointApi::Info).await?;
    Ok(Json(ImageInfoResponse {
        viewpoint_id: record.viewpoint_id,
        width: info.width,
        height: info.height,
        band_count: info.band_count,
        pixel_type: info.pixel_type,
        tile_size: record.tile_size,
    }))
}

// =============================================================================
// Map Handlers
// =============================================================================

/// List the tile matrix sets a viewpoint can be rendered into.
pub async fn map_tile_sets_handler(
    State(state): State<AppState>,
    Path(viewpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ready_viewpoint(&state, &viewpoint_id, ViewpointApi::Tile).await?;
    let tilesets: Vec<TileSetSummary> = state
        .tiles
        .tile_matrix_sets()
        .iter()
        .map(TileSetSummary::from)
        .collect();
    Ok(Json(json!({ "tilesets": tilesets })))
}

pub async fn map_tile_set_handler(
    State(state): State<AppState>,
    Path((viewpoint_id, tile_matrix_set)): Path<(String, String)>,
) -> Result<Json<TileMatrixSet>, ApiError> {
    ready_viewpoint(&state, &viewpoint_id, ViewpointApi::Tile).await?;
    let set = state.tiles.tile_matrix_sets().get(&tile_matrix_set)?;
    Ok(Json(set.clone()))
}

/// Serve a tile of a tile matrix set.
///
/// `filename` is `{col}.{format}`; `?invert_y=true` counts rows from the bottom.
pub async fn map_tile_handler(
    State(state): State<AppState>,
    Path((viewpoint_id, tile_matrix_set, tile_matrix, tile_row, filename)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    query: Result<Query<TileQueryParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let tile_matrix = parse_coordinate("tile matrix", &tile_matrix)?;
    let tile_row = parse_coordinate("tile row", &tile_row)?;
    let (tile_col, format) = parse_tile_filename(&filename)?;
    let compression = parse_compression(query.compression.as_deref())?;

    let (record, path) = ready_viewpoint(&state, &viewpoint_id, ViewpointApi::Tile).await?;

    let request = MapTileRequest {
        path: Arc::from(path.to_string_lossy().as_ref()),
        tile_matrix_set,
        tile_matrix,
        tile_row,
        tile_col,
        invert_y: query.invert_y,
        format,
        compression,
        range_adjustment: record.range_adjustment,
    };
    let outcome = state.tiles.get_map_tile(request).await?;

    Ok(tile_response(outcome, format, state.cache_max_age))
}

/// Build a tile response. Tiles without content answer 204.
fn tile_response(outcome: TileOutcome, format: TileFormat, cache_max_age: u32) -> Response {
    let cache_control = format!("private, max-age={}", cache_max_age);
    let cache_hit = if outcome.cache_hit { "true" } else { "false" };

    match outcome.tile {
        CachedTile::Data(data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, format.media_type().to_string()),
                (header::CACHE_CONTROL, cache_control),
                (header::HeaderName::from_static("x-tile-cache-hit"), cache_hit.to_string()),
            ],
            data,
        )
            .into_response(),
        CachedTile::NoContent => (
            StatusCode::NO_CONTENT,
            [
                (header::CACHE_CONTROL, cache_control),
                (header::HeaderName::from_static("x-tile-cache-hit"), cache_hit.to_string()),
            ],
            Bytes::new(),
        )
            .into_response(),
    }
}
