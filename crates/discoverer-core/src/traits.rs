//! Trait definitions for external dependencies.
//!
//! Every piece of shared state (portal records, published tokens, locks,
//! dataset rows, worker heartbeats, the task queue) is reached through one of
//! these traits. PostgreSQL implementations live in `discoverer-db`, in-memory
//! ones in [`crate::memory`], and tests plug in their own fakes.
//!
//! # Example
//!
//! ```
//! use discoverer_core::traits::PortalStore;
//! use discoverer_core::{AppError, MergeResult, Observation};
//!
//! async fn ingest<S: PortalStore>(
//!     store: &S,
//!     batch: &[Observation],
//! ) -> Result<MergeResult, AppError> {
//!     store.merge_batch(batch).await
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::dataset::{DatasetAddress, DatasetArtifact};
use crate::error::AppError;
use crate::idle::WorkerState;
use crate::lock::{LockEntry, LockHolder};
use crate::merge::MergeResult;
use crate::models::{GeoPoint, Observation, PortalRecord};
use crate::publication::Publication;
use crate::task::{CreateTaskRequest, Task, TaskCounts, TaskStatus};

/// Store for canonical portal records.
pub trait PortalStore: Send + Sync + Clone {
    /// Merges a batch of validated observations in input order.
    ///
    /// Each observation is resolved with [`crate::merge::resolve`] and applied
    /// in its own transaction, serialized per identity. A failure part way
    /// through leaves the already applied prefix in place.
    fn merge_batch(
        &self,
        observations: &[Observation],
    ) -> impl Future<Output = Result<MergeResult, AppError>> + Send;

    /// Retrieves the record carrying a guid.
    fn get_by_guid(
        &self,
        guid: &str,
    ) -> impl Future<Output = Result<Option<PortalRecord>, AppError>> + Send;

    /// Retrieves every record at the exact coordinates.
    fn find_at(
        &self,
        location: GeoPoint,
    ) -> impl Future<Output = Result<Vec<PortalRecord>, AppError>> + Send;

    /// Number of stored records.
    fn count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Map of guid to content key over all guid-bearing records.
    fn guid_index(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, String>, AppError>> + Send;

    /// Streams all records, oldest discovery first.
    fn list_stream<'a>(&'a self) -> BoxStream<'a, Result<PortalRecord, AppError>>;
}

/// Store for the latest publication of each named resource.
pub trait PublicationStore: Send + Sync + Clone {
    fn get(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Publication>, AppError>> + Send;

    /// Stores a publication unconditionally, replacing any previous one.
    fn put(&self, publication: &Publication) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Advisory mutual exclusion over named keys, without expiry.
pub trait DistributedLock: Send + Sync + Clone {
    /// Single non-blocking attempt. Returns the holder token on success.
    fn acquire(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<LockHolder>, AppError>> + Send;

    /// Releases the lock if `holder` still owns it. Returns true if it did.
    fn release(
        &self,
        key: &str,
        holder: &LockHolder,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Removes the lock whoever holds it. For operators clearing orphans.
    fn force_release(&self, key: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Lists currently held locks.
    fn list(&self) -> impl Future<Output = Result<Vec<LockEntry>, AppError>> + Send;
}

/// Store for dataset artifact rows.
///
/// At most one row exists per [`DatasetAddress`]. While a build runs the
/// store keeps the last `Ready` state so a failed build can be rolled back.
pub trait ArtifactStore: Send + Sync + Clone {
    fn find(
        &self,
        address: &DatasetAddress,
    ) -> impl Future<Output = Result<Option<DatasetArtifact>, AppError>> + Send;

    /// Marks the row `Building` for `source_token`, remembering the previous `Ready` state.
    fn begin_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
    ) -> impl Future<Output = Result<DatasetArtifact, AppError>> + Send;

    /// Marks the row `Ready` with the payload built from `source_token`.
    fn complete_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload_ref: &str,
    ) -> impl Future<Output = Result<DatasetArtifact, AppError>> + Send;

    /// Restores the previous `Ready` state, or deletes the row if there was none.
    fn rollback_build(
        &self,
        address: &DatasetAddress,
    ) -> impl Future<Output = Result<Option<DatasetArtifact>, AppError>> + Send;

    fn list(&self) -> impl Future<Output = Result<Vec<DatasetArtifact>, AppError>> + Send;
}

/// Destination for built dataset payloads.
pub trait ArtifactSink: Send + Sync + Clone {
    /// Persists a payload and returns a reference clients can download it by.
    fn put(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Reads a previously stored payload.
    fn open(&self, payload_ref: &str) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// Shared record of worker task activity.
pub trait ActivityStore: Send + Sync + Clone {
    fn record_activity(&self, at: DateTime<Utc>) -> impl Future<Output = Result<(), AppError>> + Send;

    fn last_activity(&self) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    fn set_state(&self, state: WorkerState) -> impl Future<Output = Result<(), AppError>> + Send;

    fn state(&self) -> impl Future<Output = Result<WorkerState, AppError>> + Send;
}

/// Trait for task queue persistence operations.
///
/// Implementations should ensure:
/// - Atomic claiming with `SELECT FOR UPDATE SKIP LOCKED` semantics
/// - Tasks are never claimed before their `run_at` time
/// - Safe concurrent access from multiple workers
pub trait TaskQueue: Send + Sync + Clone {
    /// Create a new task, to run at `request.run_at` or as soon as possible.
    ///
    /// When the task has a deduplication key and a pending or running task
    /// with that key exists, the existing task is returned instead.
    fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Claim the next due pending task for processing.
    ///
    /// Returns `None` if no task is due.
    fn claim_task(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    fn complete_task(&self, task_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a task as failed.
    ///
    /// If `next_retry_at` is provided the task goes back to pending until then.
    fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn cancel_task(&self, task_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_task(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// List tasks with optional status filter, newest first.
    fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    /// Finds a pending or running task with the given deduplication key.
    fn find_active_by_key(
        &self,
        dedup_key: &str,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Release all tasks claimed by a worker back to pending.
    fn release_worker_tasks(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Scheduled, reserved and active task counts, excluding idle checks.
    fn task_counts(&self) -> impl Future<Output = Result<TaskCounts, AppError>> + Send;
}

/// Control over the elastic worker process.
pub trait ProcessControl: Send + Sync + Clone {
    /// Starts a worker process unless one is already running.
    fn ensure_running(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Stops the worker process.
    fn stop(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// The worker pool as seen by the idle controller.
pub trait WorkerPool: Send + Sync + Clone {
    fn task_counts(&self) -> impl Future<Output = Result<TaskCounts, AppError>> + Send;

    fn shutdown(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}
