use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Activity,
    ScoutPoint,
    Pest,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Activity => "activity",
            EntityKind::ScoutPoint => "scout_point",
            EntityKind::Pest => "pest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activity" => Some(EntityKind::Activity),
            "scout_point" => Some(EntityKind::ScoutPoint),
            "pest" => Some(EntityKind::Pest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// Status of a sync queue row. There is no `Completed` variant on purpose:
/// completed rows are deleted, not retained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecognitionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RecognitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionStatus::Pending => "pending",
            RecognitionStatus::Processing => "processing",
            RecognitionStatus::Completed => "completed",
            RecognitionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecognitionStatus::Pending),
            "processing" => Some(RecognitionStatus::Processing),
            "completed" => Some(RecognitionStatus::Completed),
            "failed" => Some(RecognitionStatus::Failed),
            _ => None,
        }
    }
}

/// One pending remote mutation, derived from a local domain write.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub op: Operation,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One pending AI classification. `image_path` points at the raw capture on
/// disk; the bytes outlive the row until the row reaches `completed`.
#[derive(Debug, Clone)]
pub struct RecognitionTask {
    pub id: i64,
    pub image_path: String,
    pub metadata: CaptureMetadata,
    pub status: RecognitionStatus,
    pub result_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Context captured alongside a photo, sent with the classification call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureMetadata {
    pub farm_id: String,
    pub plot_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Result of the external pest classification call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub name: String,
    pub confidence: f64,
    pub severity: String,
    pub recommendation: Option<String>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub farm_id: String,
    pub plot_id: String,
    pub title: String,
    pub notes: Option<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutPoint {
    pub id: String,
    pub farm_id: String,
    pub plot_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub notes: Option<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pest {
    pub id: String,
    pub farm_id: String,
    pub plot_id: String,
    pub scout_point_id: Option<String>,
    pub name: String,
    pub confidence: f64,
    pub severity: String,
    pub recommendation: Option<String>,
    pub image_url: Option<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Outstanding work counts surfaced to the host UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCounts {
    pub sync: i64,
    pub recognition: i64,
    pub failed_sync: i64,
    pub failed_recognition: i64,
}
