//! Viewpoint records and their lifecycle.
//!
//! # Status Transitions
//!
//! ```text
//!  REQUESTED ──► IN_PROGRESS ──► READY ──┐
//!      │              │      └─► FAILED ─┤
//!      │              │                  ▼
//!      └──────────────┴────────────► DELETED (terminal)
//! ```
//!
//! Writing the status a record already has is a no-op, except for `DELETED`
//! which accepts no further writes at all.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{StoreError, StoreResult};

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewpointStatus {
    Requested,
    InProgress,
    Ready,
    Failed,
    Deleted,
}

impl ViewpointStatus {
    pub const ALL: [ViewpointStatus; 5] = [
        ViewpointStatus::Requested,
        ViewpointStatus::InProgress,
        ViewpointStatus::Ready,
        ViewpointStatus::Failed,
        ViewpointStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewpointStatus::Requested => "REQUESTED",
            ViewpointStatus::InProgress => "IN_PROGRESS",
            ViewpointStatus::Ready => "READY",
            ViewpointStatus::Failed => "FAILED",
            ViewpointStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Whether a record in this status may be written with status `next`.
    pub fn can_transition_to(self, next: ViewpointStatus) -> bool {
        use ViewpointStatus::*;

        match (self, next) {
            (Deleted, _) => false,
            (from, to) if from == to => true,
            (Requested, InProgress) => true,
            (InProgress, Ready) | (InProgress, Failed) => true,
            (_, Deleted) => true,
            _ => false,
        }
    }

    /// Statuses from which `next` may be reached, including `next` itself when
    /// rewriting it is a no-op.
    pub fn predecessors_of(next: ViewpointStatus) -> Vec<ViewpointStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    /// Check a transition, returning `StoreError::Conflict` if it is not allowed.
    pub fn check_transition(self, id: &str, next: ViewpointStatus) -> StoreResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "viewpoint {} cannot move from {} to {}",
                id, self, next
            )))
        }
    }
}

impl fmt::Display for ViewpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Range Adjustment
// =============================================================================

/// Pixel range normalisation applied before 8-bit encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeAdjustment {
    #[default]
    None,
    /// Stretch the full min/max range onto 0..=255
    Minmax,
    /// Dynamic range adjustment: stretch the 2nd..98th percentile onto 0..=255
    Dra,
}

impl RangeAdjustment {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeAdjustment::None => "NONE",
            RangeAdjustment::Minmax => "MINMAX",
            RangeAdjustment::Dra => "DRA",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(RangeAdjustment::None),
            "MINMAX" => Some(RangeAdjustment::Minmax),
            "DRA" => Some(RangeAdjustment::Dra),
            _ => None,
        }
    }

    /// Whether output pixels are forced to 8 bits per band.
    pub fn forces_byte_output(&self) -> bool {
        !matches!(self, RangeAdjustment::None)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// A viewpoint id is non-empty, has no whitespace and survives URL encoding unchanged.
pub fn is_valid_viewpoint_id(id: &str) -> bool {
    !id.is_empty()
        && !id.chars().any(char::is_whitespace)
        && urlencoding::encode(id) == id
}

// =============================================================================
// Record
// =============================================================================

/// A registered image and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewpointRecord {
    pub viewpoint_id: String,
    pub viewpoint_name: String,
    pub bucket_name: String,
    pub object_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub range_adjustment: RangeAdjustment,
    pub viewpoint_status: ViewpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_object_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ViewpointRecord {
    /// A freshly requested viewpoint.
    pub fn requested(
        viewpoint_id: impl Into<String>,
        viewpoint_name: impl Into<String>,
        bucket_name: impl Into<String>,
        object_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            viewpoint_id: viewpoint_id.into(),
            viewpoint_name: viewpoint_name.into(),
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
            tile_size: None,
            range_adjustment: RangeAdjustment::None,
            viewpoint_status: ViewpointStatus::Requested,
            local_object_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tile_size(mut self, tile_size: Option<u32>) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn with_range_adjustment(mut self, range_adjustment: RangeAdjustment) -> Self {
        self.range_adjustment = range_adjustment;
        self
    }

    /// Gate a read API on the record's status.
    ///
    /// Only `READY` records serve reads. Deleted records read as missing; every
    /// other status reports itself so the caller can poll. Updates are accepted
    /// in any status but `DELETED`.
    pub fn ensure_available(&self, api: ViewpointApi) -> Result<(), Unavailable> {
        match self.viewpoint_status {
            ViewpointStatus::Ready => Ok(()),
            ViewpointStatus::Deleted => Err(Unavailable::Deleted { api }),
            _ if api == ViewpointApi::Update => Ok(()),
            status => Err(Unavailable::NotReady {
                viewpoint_id: self.viewpoint_id.clone(),
                api,
                status,
            }),
        }
    }
}

/// The API a status gate is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewpointApi {
    Tile,
    Statistics,
    Metadata,
    Bounds,
    Info,
    Update,
}

impl ViewpointApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewpointApi::Tile => "TILE",
            ViewpointApi::Statistics => "STATISTICS",
            ViewpointApi::Metadata => "METADATA",
            ViewpointApi::Bounds => "BOUNDS",
            ViewpointApi::Info => "INFO",
            ViewpointApi::Update => "UPDATE",
        }
    }
}

/// Why a record cannot serve a read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unavailable {
    #[error("Cannot view {} for this image since this has already been deleted.", .api.as_str())]
    Deleted { api: ViewpointApi },

    #[error("Viewpoint {viewpoint_id} is not ready for {}; current status is {status}.", .api.as_str())]
    NotReady {
        viewpoint_id: String,
        api: ViewpointApi,
        status: ViewpointStatus,
    },
}

// =============================================================================
// Partial Update
// =============================================================================

/// The set of fields an update changes. Unset fields are left untouched.
///
/// `error_message` is tri-state: `None` leaves it, `Some(Some(_))` sets it and
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewpointUpdate {
    pub viewpoint_name: Option<String>,
    pub tile_size: Option<u32>,
    pub range_adjustment: Option<RangeAdjustment>,
    pub viewpoint_status: Option<ViewpointStatus>,
    pub local_object_path: Option<String>,
    pub error_message: Option<Option<String>>,
}

impl ViewpointUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: ViewpointStatus) -> Self {
        Self {
            viewpoint_status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ViewpointStatus) -> Self {
        self.viewpoint_status = Some(status);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.viewpoint_name = Some(name.into());
        self
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = Some(tile_size);
        self
    }

    pub fn with_range_adjustment(mut self, range_adjustment: RangeAdjustment) -> Self {
        self.range_adjustment = Some(range_adjustment);
        self
    }

    pub fn with_local_object_path(mut self, path: impl Into<String>) -> Self {
        self.local_object_path = Some(path.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Validate the status change against `record` and apply the changed fields.
    pub fn apply_to(&self, record: &mut ViewpointRecord) -> StoreResult<()> {
        if record.viewpoint_status == ViewpointStatus::Deleted {
            return Err(StoreError::Conflict(format!(
                "viewpoint {} has been deleted",
                record.viewpoint_id
            )));
        }
        if let Some(next) = self.viewpoint_status {
            record
                .viewpoint_status
                .check_transition(&record.viewpoint_id, next)?;
        }

        if let Some(name) = &self.viewpoint_name {
            record.viewpoint_name = name.clone();
        }
        if let Some(tile_size) = self.tile_size {
            record.tile_size = Some(tile_size);
        }
        if let Some(range_adjustment) = self.range_adjustment {
            record.range_adjustment = range_adjustment;
        }
        if let Some(status) = self.viewpoint_status {
            record.viewpoint_status = status;
        }
        if let Some(path) = &self.local_object_path {
            record.local_object_path = Some(path.clone());
        }
        if let Some(message) = &self.error_message {
            record.error_message = message.clone();
        }
        record.updated_at = Utc::now();
        Ok(())
    }
}
