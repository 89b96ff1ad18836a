//! Viewpoint records and the state store that persists them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │   HTTP handlers  │     │ ViewpointWorker  │
//! └────────┬─────────┘     └────────┬─────────┘
//!          │ create / get / list    │ get / update
//!          ▼                        ▼
//! ┌─────────────────────────────────────────────┐
//! │          dyn ViewpointStore                 │
//! │  ┌──────────────────┐ ┌──────────────────┐  │
//! │  │ MemoryViewpoint  │ │ DynamoViewpoint  │  │
//! │  │ Store (dev/test) │ │ Store (AWS)      │  │
//! │  └──────────────────┘ └──────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```

mod dynamo;
mod model;
mod store;

pub use dynamo::DynamoViewpointStore;
pub use model::{
    is_valid_viewpoint_id, RangeAdjustment, Unavailable, ViewpointApi, ViewpointRecord,
    ViewpointStatus, ViewpointUpdate,
};
pub use store::{MemoryViewpointStore, ViewpointStore};
