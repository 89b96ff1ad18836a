//! DynamoDB-backed viewpoint store.
//!
//! One item per viewpoint, keyed by `viewpoint_id`. Partial updates become a
//! single `UpdateItem` call whose condition expression encodes the allowed
//! predecessor statuses, so the transition check and the write are atomic on
//! the server side.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::model::{RangeAdjustment, ViewpointRecord, ViewpointStatus, ViewpointUpdate};
use super::store::ViewpointStore;
use crate::error::{StoreError, StoreResult};

/// Error codes that indicate the request may succeed when retried.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ThrottlingException",
    "InternalServerError",
    "ServiceUnavailable",
    "TransactionConflictException",
];

/// Viewpoint store backed by a DynamoDB table.
#[derive(Clone)]
pub struct DynamoViewpointStore {
    client: Client,
    table_name: String,
}

impl DynamoViewpointStore {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Explain why a conditional update was rejected.
    async fn resolve_condition_failure(
        &self,
        viewpoint_id: &str,
        update: &ViewpointUpdate,
    ) -> StoreError {
        match self.get(viewpoint_id).await {
            Ok(current) => match update.viewpoint_status {
                Some(next) if current.viewpoint_status != ViewpointStatus::Deleted => {
                    StoreError::Conflict(format!(
                        "viewpoint {} cannot move from {} to {}",
                        viewpoint_id, current.viewpoint_status, next
                    ))
                }
                _ => StoreError::Conflict(format!("viewpoint {} has been deleted", viewpoint_id)),
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl ViewpointStore for DynamoViewpointStore {
    async fn create(&self, record: ViewpointRecord) -> StoreResult<ViewpointRecord> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(&record)))
            .condition_expression("attribute_not_exists(viewpoint_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(record),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Err(StoreError::Conflict(format!(
                    "viewpoint {} already exists",
                    record.viewpoint_id
                )))
            }
            Err(err) => Err(classify_sdk_error("PutItem", err)),
        }
    }

    async fn get(&self, viewpoint_id: &str) -> StoreResult<ViewpointRecord> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("viewpoint_id", AttributeValue::S(viewpoint_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify_sdk_error("GetItem", e))?;

        match output.item() {
            Some(item) => from_item(item),
            None => Err(StoreError::NotFound(viewpoint_id.to_string())),
        }
    }

    async fn list(&self) -> StoreResult<Vec<ViewpointRecord>> {
        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| classify_sdk_error("Scan", e))?;

            for item in output.items() {
                match from_item(item) {
                    Ok(record) => records.push(record),
                    // One corrupt row should not hide the rest of the table.
                    Err(err) => warn!(error = %err, "Skipping malformed viewpoint item"),
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn update(
        &self,
        viewpoint_id: &str,
        update: ViewpointUpdate,
    ) -> StoreResult<ViewpointRecord> {
        let parts = UpdateParts::build(&update, Utc::now());
        debug!(
            viewpoint_id = viewpoint_id,
            expression = %parts.expression,
            condition = %parts.condition,
            "Updating viewpoint"
        );

        let result = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .key("viewpoint_id", AttributeValue::S(viewpoint_id.to_string()))
            .update_expression(parts.expression)
            .condition_expression(parts.condition)
            .set_expression_attribute_names(Some(parts.names))
            .set_expression_attribute_values(Some(parts.values))
            .return_values(ReturnValue::AllNew)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes() {
                Some(item) => from_item(item),
                None => Err(StoreError::Fatal(format!(
                    "UpdateItem for {} returned no attributes",
                    viewpoint_id
                ))),
            },
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Err(self.resolve_condition_failure(viewpoint_id, &update).await)
            }
            Err(err) => Err(classify_sdk_error("UpdateItem", err)),
        }
    }
}

// =============================================================================
// Error Classification
// =============================================================================

/// Map an SDK failure onto the store error taxonomy.
///
/// Timeouts, dispatch and response failures, and throttling codes are
/// transient; any other service error is fatal.
pub(crate) fn classify_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(message)
        }
        SdkError::ServiceError(service) => {
            let code = service.err().code().unwrap_or_default();
            if TRANSIENT_ERROR_CODES.contains(&code) {
                StoreError::Transient(message)
            } else {
                StoreError::Fatal(message)
            }
        }
        _ => StoreError::Fatal(message),
    }
}

// =============================================================================
// Item Conversion
// =============================================================================

fn to_item(record: &ViewpointRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    let s = |v: &str| AttributeValue::S(v.to_string());

    item.insert("viewpoint_id".to_string(), s(&record.viewpoint_id));
    item.insert("viewpoint_name".to_string(), s(&record.viewpoint_name));
    item.insert("bucket_name".to_string(), s(&record.bucket_name));
    item.insert("object_key".to_string(), s(&record.object_key));
    item.insert(
        "range_adjustment".to_string(),
        s(record.range_adjustment.as_str()),
    );
    item.insert(
        "viewpoint_status".to_string(),
        s(record.viewpoint_status.as_str()),
    );
    item.insert("created_at".to_string(), s(&record.created_at.to_rfc3339()));
    item.insert("updated_at".to_string(), s(&record.updated_at.to_rfc3339()));

    if let Some(tile_size) = record.tile_size {
        item.insert(
            "tile_size".to_string(),
            AttributeValue::N(tile_size.to_string()),
        );
    }
    if let Some(path) = &record.local_object_path {
        item.insert("local_object_path".to_string(), s(path));
    }
    if let Some(message) = &record.error_message {
        item.insert("error_message".to_string(), s(message));
    }
    item
}

fn from_item(item: &HashMap<String, AttributeValue>) -> StoreResult<ViewpointRecord> {
    let viewpoint_id = required_string(item, "viewpoint_id")?;
    let malformed =
        |field: &str| StoreError::Fatal(format!("malformed {} on viewpoint {}", field, viewpoint_id));

    let status_raw = required_string(item, "viewpoint_status")?;
    let viewpoint_status =
        ViewpointStatus::parse(&status_raw).ok_or_else(|| malformed("viewpoint_status"))?;

    let range_adjustment = match optional_string(item, "range_adjustment") {
        Some(raw) => RangeAdjustment::parse(&raw).ok_or_else(|| malformed("range_adjustment"))?,
        None => RangeAdjustment::None,
    };

    let tile_size = match item.get("tile_size") {
        Some(value) => Some(
            value
                .as_n()
                .ok()
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| malformed("tile_size"))?,
        ),
        None => None,
    };

    let created_at = parse_timestamp(&required_string(item, "created_at")?)
        .ok_or_else(|| malformed("created_at"))?;
    let updated_at = match optional_string(item, "updated_at") {
        Some(raw) => parse_timestamp(&raw).ok_or_else(|| malformed("updated_at"))?,
        None => created_at,
    };

    Ok(ViewpointRecord {
        viewpoint_name: required_string(item, "viewpoint_name")?,
        bucket_name: required_string(item, "bucket_name")?,
        object_key: required_string(item, "object_key")?,
        tile_size,
        range_adjustment,
        viewpoint_status,
        local_object_path: optional_string(item, "local_object_path"),
        error_message: optional_string(item, "error_message"),
        created_at,
        updated_at,
        viewpoint_id,
    })
}

fn required_string(item: &HashMap<String, AttributeValue>, field: &str) -> StoreResult<String> {
    optional_string(item, field)
        .ok_or_else(|| StoreError::Fatal(format!("viewpoint item is missing {}", field)))
}

fn optional_string(item: &HashMap<String, AttributeValue>, field: &str) -> Option<String> {
    item.get(field).and_then(|v| v.as_s().ok()).cloned()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// =============================================================================
// Update Expression
// =============================================================================

/// The pieces of an `UpdateItem` request built from a [`ViewpointUpdate`].
#[derive(Debug)]
struct UpdateParts {
    expression: String,
    condition: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl UpdateParts {
    fn build(update: &ViewpointUpdate, now: DateTime<Utc>) -> Self {
        let mut sets = Vec::new();
        let mut removes = Vec::new();
        let mut names = HashMap::new();
        let mut values = HashMap::new();

        let mut set = |field: &str, value: AttributeValue| {
            names.insert(format!("#{}", field), field.to_string());
            values.insert(format!(":{}", field), value);
            sets.push(format!("#{field} = :{field}"));
        };

        if let Some(name) = &update.viewpoint_name {
            set("viewpoint_name", AttributeValue::S(name.clone()));
        }
        if let Some(tile_size) = update.tile_size {
            set("tile_size", AttributeValue::N(tile_size.to_string()));
        }
        if let Some(range_adjustment) = update.range_adjustment {
            set(
                "range_adjustment",
                AttributeValue::S(range_adjustment.as_str().to_string()),
            );
        }
        if let Some(status) = update.viewpoint_status {
            set(
                "viewpoint_status",
                AttributeValue::S(status.as_str().to_string()),
            );
        }
        if let Some(path) = &update.local_object_path {
            set("local_object_path", AttributeValue::S(path.clone()));
        }
        let mut clear_error = false;
        match &update.error_message {
            Some(Some(message)) => set("error_message", AttributeValue::S(message.clone())),
            Some(None) => clear_error = true,
            None => {}
        }
        set("updated_at", AttributeValue::S(now.to_rfc3339()));

        if clear_error {
            names.insert("#error_message".to_string(), "error_message".to_string());
            removes.push("#error_message".to_string());
        }

        // The status attribute is always named in the condition.
        names.insert("#viewpoint_status".to_string(), "viewpoint_status".to_string());
        let allowed = match update.viewpoint_status {
            Some(next) => ViewpointStatus::predecessors_of(next),
            None => ViewpointStatus::ALL
                .into_iter()
                .filter(|s| *s != ViewpointStatus::Deleted)
                .collect(),
        };
        let placeholders: Vec<String> = allowed
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let placeholder = format!(":allowed{}", i);
                values.insert(
                    placeholder.clone(),
                    AttributeValue::S(status.as_str().to_string()),
                );
                placeholder
            })
            .collect();

        let mut expression = format!("SET {}", sets.join(", "));
        if !removes.is_empty() {
            expression.push_str(&format!(" REMOVE {}", removes.join(", ")));
        }
        let condition = format!(
            "attribute_exists(viewpoint_id) AND #viewpoint_status IN ({})",
            placeholders.join(", ")
        );

        Self {
            expression,
            condition,
            names,
            values,
        }
    }
}
