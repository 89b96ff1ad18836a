//! Viewpoint state store abstraction.
//!
//! The store is the single source of truth for viewpoint status. Both the HTTP
//! layer and the worker go through [`ViewpointStore`]; neither touches a
//! backend directly.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::model::{ViewpointRecord, ViewpointUpdate};
use crate::error::{StoreError, StoreResult};

/// Durable record of every viewpoint.
///
/// Implementations must:
/// - reject `create` for an id that already exists, deleted ones included
/// - return `StoreError::NotFound` from `get`/`update` for unknown ids
/// - apply `update` as a partial write of the changed fields only, enforcing
///   the status transition table and refusing to touch `DELETED` records
#[async_trait]
pub trait ViewpointStore: Send + Sync + 'static {
    async fn create(&self, record: ViewpointRecord) -> StoreResult<ViewpointRecord>;

    async fn get(&self, viewpoint_id: &str) -> StoreResult<ViewpointRecord>;

    async fn list(&self) -> StoreResult<Vec<ViewpointRecord>>;

    async fn update(
        &self,
        viewpoint_id: &str,
        update: ViewpointUpdate,
    ) -> StoreResult<ViewpointRecord>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local store used for local development and tests.
///
/// Each update is validated and applied under one write lock, so status
/// checks and writes are atomic per record.
#[derive(Default)]
pub struct MemoryViewpointStore {
    records: RwLock<HashMap<String, ViewpointRecord>>,
}

impl MemoryViewpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ViewpointStore for MemoryViewpointStore {
    async fn create(&self, record: ViewpointRecord) -> StoreResult<ViewpointRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.viewpoint_id) {
            return Err(StoreError::Conflict(format!(
                "viewpoint {} already exists",
                record.viewpoint_id
            )));
        }
        records.insert(record.viewpoint_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, viewpoint_id: &str) -> StoreResult<ViewpointRecord> {
        self.records
            .read()
            .await
            .get(viewpoint_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(viewpoint_id.to_string()))
    }

    async fn list(&self) -> StoreResult<Vec<ViewpointRecord>> {
        let records = self.records.read().await;
        let mut items: Vec<_> = records.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn update(
        &self,
        viewpoint_id: &str,
        update: ViewpointUpdate,
    ) -> StoreResult<ViewpointRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(viewpoint_id)
            .ok_or_else(|| StoreError::NotFound(viewpoint_id.to_string()))?;

        // Apply to a copy so a rejected update leaves the stored record untouched.
        let mut updated = record.clone();
        update.apply_to(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }
}
