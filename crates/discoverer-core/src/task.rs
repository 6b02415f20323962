//! Task queue types for background work.
//!
//! Dataset builds, index publishes and worker idle checks all run as tasks
//! on a persistent queue, so they survive restarts and can be scheduled for
//! a future time (`run_at`).
//!
//! # Architecture
//!
//! Tasks flow through these states:
//! ```text
//! pending → running → completed
//!              ↓
//!           failed (if retries exhausted)
//!              ↓
//!           pending (if retries available, with next_retry_at)
//! ```
//!
//! # Retry Strategy
//!
//! Uses exponential backoff with configurable delays:
//! - Attempt 1: 1 minute
//! - Attempt 2: 5 minutes
//! - Attempt 3: 30 minutes
//! - After max retries: permanently failed

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dataset::DatasetRequest;
use crate::error::AppError;
use crate::lock::LockHolder;

// =============================================================================
// Task Status
// =============================================================================

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is waiting for its `run_at` time or a free worker.
    Pending,
    /// Task is currently being processed by a worker.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed after exhausting all retries.
    Failed,
    /// Task was cancelled by user or system.
    Cancelled,
}

impl TaskStatus {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Error type for parsing TaskStatus from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskStatusError(String);

impl std::fmt::Display for ParseTaskStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid task status: {}", self.0)
    }
}

impl std::error::Error for ParseTaskStatusError {}

impl std::str::FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Configuration for task retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Maximum delay cap.
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delay: TimeDelta::minutes(60),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given retry attempt using exponential backoff.
    ///
    /// - Attempt 1: 1 minute
    /// - Attempt 2: 5 minutes
    /// - Attempt 3: 30 minutes
    /// - Attempt 4+: 60 minutes (capped)
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        if attempt == 0 {
            return TimeDelta::zero();
        }

        let minutes = match attempt {
            1 => 1,
            2 => 5,
            3 => 30,
            _ => 60,
        };

        std::cmp::min(TimeDelta::minutes(minutes), self.max_delay)
    }
}

// =============================================================================
// Task Kind
// =============================================================================

/// What a task does. Stored as JSON in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Build (or rebuild) a dataset artifact.
    BuildDataset { request: DatasetRequest },
    /// Publish a fresh snapshot of a resource.
    PublishIndex { name: String },
    /// Decide whether the worker has been idle long enough to stop.
    IdleCheck { holder: LockHolder },
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::BuildDataset { .. } => "build_dataset",
            TaskKind::PublishIndex { .. } => "publish_index",
            TaskKind::IdleCheck { .. } => "idle_check",
        }
    }

    /// Idle checks do not keep the worker alive; everything else does.
    pub fn counts_as_activity(&self) -> bool {
        !matches!(self, TaskKind::IdleCheck { .. })
    }

    /// Key under which at most one pending or running task may exist.
    pub fn dedup_key(&self) -> Result<Option<String>, AppError> {
        match self {
            TaskKind::BuildDataset { request } => Ok(Some(request.address()?.lock_key())),
            TaskKind::PublishIndex { .. } | TaskKind::IdleCheck { .. } => Ok(None),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// A task in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,

    pub kind: TaskKind,

    /// Current task status.
    pub status: TaskStatus,

    /// Earliest time the task may be claimed.
    pub run_at: DateTime<Utc>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,

    /// When the task started processing.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task completed (success or failure).
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of retry attempts made.
    pub retry_count: u32,

    /// Maximum retries allowed.
    pub max_retries: u32,

    /// When to attempt the next retry.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Error message if failed.
    pub error_message: Option<String>,

    /// ID of the worker processing this task.
    pub worker_id: Option<String>,

    pub dedup_key: Option<String>,
}

impl Task {
    /// Check if the task can be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Calculate the next retry time based on current retry count.
    pub fn calculate_next_retry(&self, config: &RetryConfig) -> DateTime<Utc> {
        let delay = config.delay_for_attempt(self.retry_count + 1);
        Utc::now() + delay
    }
}

// =============================================================================
// Task Creation Request
// =============================================================================

/// Request to create a new task.
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub kind: TaskKind,
    /// Earliest run time (now if None).
    pub run_at: Option<DateTime<Utc>>,
    /// Maximum retries (uses default if None).
    pub max_retries: Option<u32>,
}

impl CreateTaskRequest {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            run_at: None,
            max_retries: None,
        }
    }

    /// Schedule the task for a later time.
    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Set maximum retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

// =============================================================================
// Task Counts
// =============================================================================

/// Outstanding work as seen by the idle controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Pending tasks whose `run_at` is still in the future.
    pub scheduled: u64,
    /// Pending tasks that are due but not yet claimed.
    pub reserved: u64,
    /// Running tasks.
    pub active: u64,
}

impl TaskCounts {
    pub fn is_idle(&self) -> bool {
        self.scheduled == 0 && self.reserved == 0 && self.active == 0
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.reserved + self.active
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,
    /// How often to poll for new tasks.
    pub poll_interval: std::time::Duration,
    /// Retry configuration.
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: std::time::Duration::from_secs(5),
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Set the worker ID.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
