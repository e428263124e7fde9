//! Operation types for the sync queue.
//!
//! Defines the closed set of mutations that can be queued, their payloads,
//! and the persisted queue item that wraps them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FieldsyncError;

/// Kinds of mutation that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Record a field inspection
    Inspection,
    /// Record a field operation (planting, spraying, harvest, ...)
    FieldOperation,
    /// Update a plot
    PlotUpdate,
    /// Update a farm
    FarmUpdate,
    /// Upload an inspection photo
    ImageUpload,
    /// Fetch a vegetation index for a plot
    VegetationIndexRequest,
}

impl OperationKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Inspection,
        Self::FieldOperation,
        Self::PlotUpdate,
        Self::FarmUpdate,
        Self::ImageUpload,
        Self::VegetationIndexRequest,
    ];

    /// Stable storage tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inspection => "inspection",
            Self::FieldOperation => "field_operation",
            Self::PlotUpdate => "plot_update",
            Self::FarmUpdate => "farm_update",
            Self::ImageUpload => "image_upload",
            Self::VegetationIndexRequest => "vegetation_index_request",
        }
    }

    /// Get the display name for this operation kind.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Inspection => "Inspection",
            Self::FieldOperation => "Field Operation",
            Self::PlotUpdate => "Plot Update",
            Self::FarmUpdate => "Farm Update",
            Self::ImageUpload => "Image Upload",
            Self::VegetationIndexRequest => "Vegetation Index",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = FieldsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| FieldsyncError::InvalidArgument(format!("Unknown operation type: {s}")))
    }
}

/// Status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be attempted
    Pending,
    /// Handed to an executor
    Syncing,
    /// Delivered to the server
    Completed,
    /// Retry budget exhausted
    Failed,
    /// Failed at least once, waiting for its backoff to elapse
    Retrying,
}

impl QueueStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Syncing,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if this status is terminal (no automatic action will follow).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable storage tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = FieldsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == normalized)
            .ok_or_else(|| FieldsyncError::InvalidArgument(format!("Unknown status: {s}")))
    }
}

/// Payload for an inspection recorded in the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionPayload {
    /// Client-side id of the cached inspection
    pub local_id: String,
    pub plot_id: String,
    pub farm_id: String,
    pub category: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub severity: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Payload for a field operation (planting, spraying, harvest, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOperationPayload {
    /// Client-side id of the cached operation
    pub local_id: String,
    pub plot_id: String,
    pub activity: String,
    pub performed_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Products, doses and machinery, passed through as-is
    #[serde(default)]
    pub inputs: Option<Value>,
}

/// Payload for a partial update of an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdatePayload {
    pub id: String,
    /// Changed fields
    #[serde(flatten)]
    pub changes: Map<String, Value>,
}

/// Payload for an image upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUploadPayload {
    pub plot_id: String,
    #[serde(default)]
    pub inspection_id: Option<String>,
    pub file_name: String,
    /// Base64-encoded image bytes
    pub image_base64: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Payload for fetching a vegetation index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationIndexPayload {
    pub plot_id: String,
    /// Acquisition date (`YYYY-MM-DD`)
    pub date: String,
    #[serde(default = "default_index_type")]
    pub index_type: String,
}

fn default_index_type() -> String {
    "ndvi".to_string()
}

/// A queued mutation with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    Inspection(InspectionPayload),
    FieldOperation(FieldOperationPayload),
    PlotUpdate(EntityUpdatePayload),
    FarmUpdate(EntityUpdatePayload),
    ImageUpload(ImageUploadPayload),
    VegetationIndexRequest(VegetationIndexPayload),
}

impl Operation {
    /// Kind tag of this operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Inspection(_) => OperationKind::Inspection,
            Self::FieldOperation(_) => OperationKind::FieldOperation,
            Self::PlotUpdate(_) => OperationKind::PlotUpdate,
            Self::FarmUpdate(_) => OperationKind::FarmUpdate,
            Self::ImageUpload(_) => OperationKind::ImageUpload,
            Self::VegetationIndexRequest(_) => OperationKind::VegetationIndexRequest,
        }
    }

    /// Serialize the payload alone, without the kind tag.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn payload_json(&self) -> Result<String, FieldsyncError> {
        let json = match self {
            Self::Inspection(p) => serde_json::to_string(p)?,
            Self::FieldOperation(p) => serde_json::to_string(p)?,
            Self::PlotUpdate(p) | Self::FarmUpdate(p) => serde_json::to_string(p)?,
            Self::ImageUpload(p) => serde_json::to_string(p)?,
            Self::VegetationIndexRequest(p) => serde_json::to_string(p)?,
        };
        Ok(json)
    }

    /// Rebuild an operation from its kind tag and payload JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the kind.
    pub fn from_parts(kind: OperationKind, payload: &str) -> Result<Self, FieldsyncError> {
        let payload: Value = serde_json::from_str(payload)?;
        let tagged = serde_json::json!({ "type": kind.as_str(), "payload": payload });
        Ok(serde_json::from_value(tagged)?)
    }

    /// Id of the entity this operation targets, if it already exists remotely.
    #[must_use]
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::PlotUpdate(p) | Self::FarmUpdate(p) => Some(&p.id),
            Self::ImageUpload(p) => p.inspection_id.as_deref(),
            Self::VegetationIndexRequest(p) => Some(&p.plot_id),
            Self::Inspection(_) | Self::FieldOperation(_) => None,
        }
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Lower values are attempted first
    pub priority: i32,
    /// Item that must complete before this one is attempted
    pub depends_on: Option<i64>,
    /// Free-form source label
    pub origin: String,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 1,
            depends_on: None,
            origin: "app".to_string(),
        }
    }
}

impl EnqueueOptions {
    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require `id` to complete first.
    #[must_use]
    pub const fn depends_on(mut self, id: i64) -> Self {
        self.depends_on = Some(id);
        self
    }

    /// Set the origin label.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

/// A persisted queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Auto-assigned, creation-ordered id
    pub id: i64,
    /// The mutation to replay
    pub operation: Operation,
    pub priority: i32,
    pub depends_on: Option<i64>,
    pub status: QueueStatus,
    /// Number of failed attempts
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time a `Retrying` item may be attempted again
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Server response of the successful attempt
    pub result: Option<Value>,
    /// Token sent with every attempt so the server can drop duplicates
    pub idempotency_key: String,
    pub origin: String,
}

impl QueueItem {
    /// Kind tag of the queued operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Whether the scheduler may pick this item at `now`, ignoring dependencies.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Retrying => self.next_eligible_at.map_or(true, |t| t <= now),
            QueueStatus::Syncing | QueueStatus::Completed | QueueStatus::Failed => false,
        }
    }
}
