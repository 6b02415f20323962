//! Response DTOs for API endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use discoverer_core::{
    DatasetAddress, DatasetArtifact, MergeRejection, MergeResult, PortalRecord, PortalVersion,
    RejectionReason, Task, TaskCounts,
};

// =============================================================================
// Health
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("healthy" or "degraded")
    pub status: String,
    /// Server version
    pub version: String,
    /// Database connectivity status
    pub database: ServiceStatus,
}

/// Status of an individual service component.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceStatus {
    /// Whether the service is reachable
    pub healthy: bool,
    /// Optional message (e.g., error details)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Portals
// =============================================================================

/// Result of one submitted batch.
#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub inserted: usize,
    /// Every written record (`inserted + modified`)
    pub upserted: usize,
    pub modified: usize,
    pub unchanged: usize,
    /// Skipped observations, by position in the submitted batch
    pub rejected: Vec<RejectionDto>,
    /// New index token, when the batch changed anything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl IngestResponse {
    pub fn new(result: MergeResult, token: Option<String>) -> Self {
        Self {
            inserted: result.inserted,
            upserted: result.upserted,
            modified: result.modified,
            unchanged: result.unchanged,
            rejected: result.rejected.into_iter().map(RejectionDto::from).collect(),
            token,
        }
    }
}

/// A skipped observation.
#[derive(Debug, Serialize, ToSchema)]
pub struct RejectionDto {
    pub index: usize,
    pub guid: Option<String>,
    /// "guid_mismatch" or "invalid_observation"
    pub reason: String,
    /// Guid already owning the coordinates, for guid mismatches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<MergeRejection> for RejectionDto {
    fn from(r: MergeRejection) -> Self {
        let (reason, existing_guid, message) = match r.reason {
            RejectionReason::GuidMismatch { existing_guid } => {
                ("guid_mismatch", Some(existing_guid), None)
            }
            RejectionReason::InvalidObservation { message } => {
                ("invalid_observation", None, Some(message))
            }
        };
        Self {
            index: r.index,
            guid: r.guid,
            reason: reason.to_string(),
            existing_guid,
            message,
        }
    }
}

/// A merged portal record with its history.
#[derive(Debug, Serialize, ToSchema)]
pub struct PortalResponse {
    pub id: Uuid,
    pub name: String,
    pub guid: Option<String>,
    pub lat_e6: i32,
    pub lng_e6: i32,
    pub region: Option<String>,
    pub reporter: Option<String>,
    pub content_key: String,
    /// Link to the portal on the Intel map
    pub intel_url: String,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every distinct version, oldest first, ending with the current one
    pub history: Vec<PortalVersionDto>,
}

impl From<PortalRecord> for PortalResponse {
    fn from(r: PortalRecord) -> Self {
        Self {
            intel_url: r.intel_url(),
            id: r.id,
            name: r.name,
            guid: r.guid,
            lat_e6: r.location.lat_e6,
            lng_e6: r.location.lng_e6,
            region: r.region,
            reporter: r.reporter,
            content_key: r.content_key,
            discovered_at: r.discovered_at,
            updated_at: r.updated_at,
            history: r.history.into_iter().map(PortalVersionDto::from).collect(),
        }
    }
}

/// One version in a portal's history.
#[derive(Debug, Serialize, ToSchema)]
pub struct PortalVersionDto {
    pub name: String,
    pub guid: Option<String>,
    pub lat_e6: i32,
    pub lng_e6: i32,
    pub region: Option<String>,
    pub reporter: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub content_key: String,
}

impl From<PortalVersion> for PortalVersionDto {
    fn from(v: PortalVersion) -> Self {
        Self {
            name: v.name,
            guid: v.guid,
            lat_e6: v.location.lat_e6,
            lng_e6: v.location.lng_e6,
            region: v.region,
            reporter: v.reporter,
            observed_at: v.observed_at,
            content_key: v.content_key,
        }
    }
}

// =============================================================================
// Datasets
// =============================================================================

/// State of a requested dataset.
#[derive(Debug, Serialize, ToSchema)]
pub struct DatasetStatusResponse {
    /// "missing", "building", "ready" or "stale"
    pub status: String,
    pub name: String,
    pub format: String,
    pub config_hash: String,
    /// Live version token of the source
    pub token: String,
    /// Download path, once the artifact is ready
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_ref: Option<String>,
    /// Build task enqueued (or already queued) for this request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

/// Query path under which a ready artifact can be downloaded.
pub fn download_ref(address: &DatasetAddress) -> String {
    format!(
        "/api/v1/datasets/download?name={}&format={}&config_hash={}",
        address.name, address.format, address.config_hash
    )
}

/// A stored dataset artifact.
#[derive(Debug, Serialize, ToSchema)]
pub struct ArtifactResponse {
    pub name: String,
    pub format: String,
    pub config_hash: String,
    pub source_token: String,
    /// "building" or "ready"
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DatasetArtifact> for ArtifactResponse {
    fn from(a: DatasetArtifact) -> Self {
        Self {
            name: a.name,
            format: a.format.to_string(),
            config_hash: a.config_hash,
            source_token: a.source_token,
            status: a.status.to_string(),
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

// =============================================================================
// Tasks and worker
// =============================================================================

/// A queued task.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    /// "build_dataset", "publish_index" or "idle_check"
    pub kind: String,
    /// "pending", "running", "completed", "failed" or "cancelled"
    pub status: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id,
            kind: t.kind.as_str().to_string(),
            status: t.status.to_string(),
            run_at: t.run_at,
            created_at: t.created_at,
            started_at: t.started_at,
            completed_at: t.completed_at,
            retry_count: t.retry_count,
            max_retries: t.max_retries,
            error_message: t.error_message,
        }
    }
}

/// Worker lifecycle and outstanding work.
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerStatusResponse {
    /// "idle", "active", "pending_shutdown" or "stopped"
    pub state: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Pending tasks not yet due
    pub scheduled: u64,
    /// Due tasks waiting for a worker
    pub reserved: u64,
    /// Running tasks
    pub active: u64,
    /// How the worker process is controlled ("heroku", "local" or "external")
    pub control: String,
}

impl WorkerStatusResponse {
    pub fn new(
        state: String,
        last_activity_at: Option<DateTime<Utc>>,
        counts: TaskCounts,
        control: &str,
    ) -> Self {
        Self {
            state,
            last_activity_at,
            scheduled: counts.scheduled,
            reserved: counts.reserved,
            active: counts.active,
            control: control.to_string(),
        }
    }
}
