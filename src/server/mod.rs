//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │      /viewpoints  /viewpoints/{id}/image  /viewpoints/{id}/map  │
//! │                                                                 │
//! │  ┌───────────────────────────┐  ┌───────────────────────────┐   │
//! │  │         handlers          │  │          routes           │   │
//! │  │ (requests, error mapping) │  │ (router, CORS, tracing)   │   │
//! │  └───────────────────────────┘  └───────────────────────────┘   │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 ▼                               ▼
//!         ViewpointStore / RequestQueue      TileProvider
//! ```

pub mod handlers;
pub mod routes;

pub use handlers::{
    parse_tile_filename, ApiError, AppState, CreateViewpointRequest, ErrorResponse,
    ImageInfoResponse, TileQueryParams, TileSetSummary, UpdateViewpointRequest,
    ViewpointListResponse, DEFAULT_CACHE_MAX_AGE,
};
pub use routes::{create_router, RouterConfig, REQUEST_ID_HEADER};
