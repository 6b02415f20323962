//! In-memory implementations of the store traits.
//!
//! Used by tests and by single-process deployments that do not need state to
//! survive a restart. Each store is a cheap `Clone` handle onto shared state;
//! every operation takes the store-wide mutex once, so merges are trivially
//! serialized per identity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::dataset::{ArtifactStatus, DatasetAddress, DatasetArtifact};
use crate::error::AppError;
use crate::idle::WorkerState;
use crate::lock::{LockEntry, LockHolder};
use crate::merge::{Candidates, MergeDecision, MergeOutcome, MergeResult, RejectionReason, resolve};
use crate::models::{GeoPoint, Observation, PortalRecord};
use crate::publication::Publication;
use crate::task::{CreateTaskRequest, Task, TaskCounts, TaskKind, TaskStatus};
use crate::traits::{
    ActivityStore, ArtifactSink, ArtifactStore, DistributedLock, PortalStore, PublicationStore,
    TaskQueue,
};

/// Locks a mutex, recovering the data if a previous holder panicked.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Portals
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryPortalStore {
    records: Arc<Mutex<Vec<PortalRecord>>>,
}

impl MemoryPortalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<PortalRecord> {
        guard(&self.records).clone()
    }
}

enum Step {
    Insert,
    Update(Uuid),
    Unchanged,
    Reject(String),
}

fn merge_one(records: &mut Vec<PortalRecord>, observation: &Observation, now: DateTime<Utc>) -> Step {
    let location = observation.location();
    let step = {
        let by_guid = observation
            .guid
            .as_deref()
            .and_then(|g| records.iter().find(|r| r.guid.as_deref() == Some(g)));
        let candidates = Candidates {
            by_guid,
            at_location: records.iter().filter(|r| r.location == location).collect(),
        };
        match resolve(observation, &candidates) {
            MergeDecision::Insert => Step::Insert,
            MergeDecision::Update(record) => Step::Update(record.id),
            MergeDecision::Unchanged(_) => Step::Unchanged,
            MergeDecision::GuidMismatch { existing_guid } => Step::Reject(existing_guid),
        }
    };

    match &step {
        Step::Insert => records.push(PortalRecord::from_observation(observation, now)),
        Step::Update(id) => {
            if let Some(record) = records.iter_mut().find(|r| r.id == *id) {
                record.apply(observation, now);
            }
        }
        Step::Unchanged | Step::Reject(_) => {}
    }
    step
}

impl PortalStore for MemoryPortalStore {
    async fn merge_batch(&self, observations: &[Observation]) -> Result<MergeResult, AppError> {
        let mut result = MergeResult::new();
        for (index, observation) in observations.iter().enumerate() {
            let now = Utc::now();
            let step = {
                let mut records = guard(&self.records);
                merge_one(&mut records, observation, now)
            };
            match step {
                Step::Insert => result.record(MergeOutcome::Inserted),
                Step::Update(_) => result.record(MergeOutcome::Modified),
                Step::Unchanged => result.record(MergeOutcome::Unchanged),
                Step::Reject(existing_guid) => result.reject(
                    index,
                    observation.guid.clone(),
                    RejectionReason::GuidMismatch { existing_guid },
                ),
            }
        }
        Ok(result)
    }

    async fn get_by_guid(&self, guid: &str) -> Result<Option<PortalRecord>, AppError> {
        Ok(guard(&self.records)
            .iter()
            .find(|r| r.guid.as_deref() == Some(guid))
            .cloned())
    }

    async fn find_at(&self, location: GeoPoint) -> Result<Vec<PortalRecord>, AppError> {
        Ok(guard(&self.records)
            .iter()
            .filter(|r| r.location == location)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, AppError> {
        Ok(guard(&self.records).len() as u64)
    }

    async fn guid_index(&self) -> Result<BTreeMap<String, String>, AppError> {
        Ok(guard(&self.records)
            .iter()
            .filter_map(|r| r.guid.clone().map(|g| (g, r.content_key.clone())))
            .collect())
    }

    fn list_stream<'a>(&'a self) -> BoxStream<'a, Result<PortalRecord, AppError>> {
        let mut records = guard(&self.records).clone();
        records.sort_by_key(|r| r.discovered_at);
        futures::stream::iter(records.into_iter().map(Ok)).boxed()
    }
}

// =============================================================================
// Publications
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryPublicationStore {
    publications: Arc<Mutex<HashMap<String, Publication>>>,
}

impl MemoryPublicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PublicationStore for MemoryPublicationStore {
    async fn get(&self, name: &str) -> Result<Option<Publication>, AppError> {
        Ok(guard(&self.publications).get(name).cloned())
    }

    async fn put(&self, publication: &Publication) -> Result<(), AppError> {
        guard(&self.publications).insert(publication.name().to_string(), publication.clone());
        Ok(())
    }
}

// =============================================================================
// Locks
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryLockStore {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistributedLock for MemoryLockStore {
    async fn acquire(&self, key: &str) -> Result<Option<LockHolder>, AppError> {
        let mut locks = guard(&self.locks);
        if locks.contains_key(key) {
            return Ok(None);
        }
        let holder = LockHolder::generate();
        locks.insert(
            key.to_string(),
            LockEntry {
                key: key.to_string(),
                holder: holder.clone(),
                acquired_at: Utc::now(),
            },
        );
        Ok(Some(holder))
    }

    async fn release(&self, key: &str, holder: &LockHolder) -> Result<bool, AppError> {
        let mut locks = guard(&self.locks);
        match locks.get(key) {
            Some(entry) if entry.holder == *holder => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, key: &str) -> Result<bool, AppError> {
        Ok(guard(&self.locks).remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<LockEntry>, AppError> {
        let mut entries: Vec<LockEntry> = guard(&self.locks).values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

// =============================================================================
// Dataset artifacts
// =============================================================================

struct ArtifactSlot {
    current: DatasetArtifact,
    /// Last `Ready` state, kept while a rebuild is in progress.
    previous: Option<DatasetArtifact>,
}

#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    slots: Arc<Mutex<HashMap<DatasetAddress, ArtifactSlot>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn find(&self, address: &DatasetAddress) -> Result<Option<DatasetArtifact>, AppError> {
        Ok(guard(&self.slots).get(address).map(|s| s.current.clone()))
    }

    async fn begin_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
    ) -> Result<DatasetArtifact, AppError> {
        let mut slots = guard(&self.slots);
        let now = Utc::now();
        let slot = slots.entry(address.clone()).or_insert_with(|| ArtifactSlot {
            current: DatasetArtifact::pending(address, source_token),
            previous: None,
        });

        if slot.current.status == ArtifactStatus::Ready {
            slot.previous = Some(slot.current.clone());
        }
        slot.current.status = ArtifactStatus::Building;
        slot.current.source_token = source_token.to_string();
        slot.current.payload_ref = None;
        slot.current.updated_at = now;
        Ok(slot.current.clone())
    }

    async fn complete_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload_ref: &str,
    ) -> Result<DatasetArtifact, AppError> {
        let mut slots = guard(&self.slots);
        let slot = slots.get_mut(address).ok_or_else(|| {
            AppError::StorageError(format!("no build in progress for {}", address))
        })?;

        slot.current.status = ArtifactStatus::Ready;
        slot.current.source_token = source_token.to_string();
        slot.current.payload_ref = Some(payload_ref.to_string());
        slot.current.updated_at = Utc::now();
        slot.previous = None;
        Ok(slot.current.clone())
    }

    async fn rollback_build(
        &self,
        address: &DatasetAddress,
    ) -> Result<Option<DatasetArtifact>, AppError> {
        let mut slots = guard(&self.slots);
        let Some(slot) = slots.get_mut(address) else {
            return Ok(None);
        };

        match slot.previous.take() {
            Some(previous) => {
                slot.current = previous;
                Ok(Some(slot.current.clone()))
            }
            None => {
                slots.remove(address);
                Ok(None)
            }
        }
    }

    async fn list(&self) -> Result<Vec<DatasetArtifact>, AppError> {
        let mut rows: Vec<DatasetArtifact> =
            guard(&self.slots).values().map(|s| s.current.clone()).collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }
}

/// Keeps dataset payloads in memory under `mem://` references.
#[derive(Clone, Default)]
pub struct MemoryArtifactSink {
    payloads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactSink for MemoryArtifactSink {
    async fn put(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload: Vec<u8>,
    ) -> Result<String, AppError> {
        let payload_ref = format!(
            "mem://{}/{}/{}.{}",
            address.name,
            address.config_hash,
            source_token,
            address.format.extension()
        );
        guard(&self.payloads).insert(payload_ref.clone(), payload);
        Ok(payload_ref)
    }

    async fn open(&self, payload_ref: &str) -> Result<Vec<u8>, AppError> {
        guard(&self.payloads)
            .get(payload_ref)
            .cloned()
            .ok_or_else(|| AppError::StorageError(format!("payload not found: {}", payload_ref)))
    }
}

// =============================================================================
// Worker activity
// =============================================================================

#[derive(Default)]
struct ActivityState {
    last_activity: Option<DateTime<Utc>>,
    state: WorkerState,
}

#[derive(Clone, Default)]
pub struct MemoryActivityStore {
    inner: Arc<Mutex<ActivityState>>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityStore for MemoryActivityStore {
    async fn record_activity(&self, at: DateTime<Utc>) -> Result<(), AppError> {
        guard(&self.inner).last_activity = Some(at);
        Ok(())
    }

    async fn last_activity(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(guard(&self.inner).last_activity)
    }

    async fn set_state(&self, state: WorkerState) -> Result<(), AppError> {
        guard(&self.inner).state = state;
        Ok(())
    }

    async fn state(&self) -> Result<WorkerState, AppError> {
        Ok(guard(&self.inner).state)
    }
}

// =============================================================================
// Task queue
// =============================================================================

/// In-memory task queue with the same claim rules as the PostgreSQL one.
#[derive(Clone, Default)]
pub struct MemoryTaskQueue {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every task, in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        guard(&self.tasks).clone()
    }

    /// Task counts as of `now`, excluding idle checks.
    pub fn task_counts_at(&self, now: DateTime<Utc>) -> TaskCounts {
        let tasks = guard(&self.tasks);
        let mut counts = TaskCounts::default();
        for task in tasks.iter() {
            if matches!(task.kind, TaskKind::IdleCheck { .. }) {
                continue;
            }
            match task.status {
                TaskStatus::Pending if due_at(task) > now => counts.scheduled += 1,
                TaskStatus::Pending => counts.reserved += 1,
                TaskStatus::Running => counts.active += 1,
                _ => {}
            }
        }
        counts
    }

    /// Claims the next task due at `now`.
    pub fn claim_task_at(&self, worker_id: &str, now: DateTime<Utc>) -> Option<Task> {
        let mut tasks = guard(&self.tasks);
        let task = tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Pending && due_at(t) <= now)
            .min_by_key(|t| (due_at(t), t.created_at))?;

        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        task.worker_id = Some(worker_id.to_string());
        Some(task.clone())
    }

    fn update<F>(&self, task_id: Uuid, f: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = guard(&self.tasks);
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AppError::Generic(format!("Task not found: {}", task_id)))?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }
}

/// Earliest time a pending task may run.
fn due_at(task: &Task) -> DateTime<Utc> {
    match task.next_retry_at {
        Some(retry_at) if retry_at > task.run_at => retry_at,
        _ => task.run_at,
    }
}

impl TaskQueue for MemoryTaskQueue {
    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let now = Utc::now();
        let dedup_key = request.kind.dedup_key()?;
        let mut tasks = guard(&self.tasks);
        if let Some(key) = dedup_key.as_deref() {
            if let Some(existing) = tasks
                .iter()
                .find(|t| !t.status.is_terminal() && t.dedup_key.as_deref() == Some(key))
            {
                return Ok(existing.clone());
            }
        }
        let task = Task {
            id: Uuid::new_v4(),
            kind: request.kind,
            status: TaskStatus::Pending,
            run_at: request.run_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(3),
            next_retry_at: None,
            error_message: None,
            worker_id: None,
            dedup_key,
        };
        tasks.push(task.clone());
        Ok(task)
    }

    async fn claim_task(&self, worker_id: &str) -> Result<Option<Task>, AppError> {
        Ok(self.claim_task_at(worker_id, Utc::now()))
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), AppError> {
        self.update(task_id, |task| {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.worker_id = None;
        })
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.update(task_id, |task| {
            task.error_message = Some(error.to_string());
            task.worker_id = None;
            task.started_at = None;
            match next_retry_at {
                Some(at) => {
                    task.status = TaskStatus::Pending;
                    task.retry_count += 1;
                    task.next_retry_at = Some(at);
                }
                None => {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(Utc::now());
                }
            }
        })
    }

    async fn cancel_task(&self, task_id: Uuid) -> Result<(), AppError> {
        self.update(task_id, |task| {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            task.worker_id = None;
        })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(guard(&self.tasks).iter().find(|t| t.id == task_id).cloned())
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, AppError> {
        let tasks = guard(&self.tasks);
        Ok(tasks
            .iter()
            .rev()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_active_by_key(&self, dedup_key: &str) -> Result<Option<Task>, AppError> {
        Ok(guard(&self.tasks)
            .iter()
            .find(|t| {
                !t.status.is_terminal() && t.dedup_key.as_deref() == Some(dedup_key)
            })
            .cloned())
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut tasks = guard(&self.tasks);
        let mut released = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Running && task.worker_id.as_deref() == Some(worker_id) {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.started_at = None;
                task.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn task_counts(&self) -> Result<TaskCounts, AppError> {
        Ok(self.task_counts_at(Utc::now()))
    }
}
