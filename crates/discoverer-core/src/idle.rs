//! Idle-timeout lifecycle of the elastic worker process.
//!
//! Every accepted task records activity. The first activity after a quiet
//! period takes the idle lock and schedules an idle check one idle period
//! later; later activity finds the lock taken and only bumps the timestamp.
//! When the check runs it either reschedules itself relative to the most
//! recent activity, or releases the lock and stops the worker if the queue
//! has nothing scheduled, reserved or running.
//!
//! ```text
//! Idle → Active → PendingShutdown → Stopped
//!                       ↓
//!                     Active (work still queued)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IdleConfig;
use crate::error::AppError;
use crate::lock::LockHolder;
use crate::task::{CreateTaskRequest, Task, TaskCounts, TaskKind};
use crate::traits::{ActivityStore, DistributedLock, ProcessControl, TaskQueue, WorkerPool};
use crate::worker::{TaskHandler, TaskInterceptor};

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Active,
    /// An idle check is scheduled.
    PendingShutdown,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Active => "active",
            WorkerState::PendingShutdown => "pending_shutdown",
            WorkerState::Stopped => "stopped",
        }
    }
}

/// Error type for parsing WorkerState from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWorkerStateError(String);

impl std::fmt::Display for ParseWorkerStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid worker state: {}", self.0)
    }
}

impl std::error::Error for ParseWorkerStateError {}

impl std::str::FromStr for WorkerState {
    type Err = ParseWorkerStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerState::Idle),
            "active" => Ok(WorkerState::Active),
            "pending_shutdown" => Ok(WorkerState::PendingShutdown),
            "stopped" => Ok(WorkerState::Stopped),
            _ => Err(ParseWorkerStateError(s.to_string())),
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an idle check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheckOutcome {
    /// The pool was idle and has been shut down.
    Stopped,
    /// The idle period elapsed but work is still outstanding.
    Busy(TaskCounts),
    /// Activity happened since scheduling; checking again at this time.
    Rescheduled(DateTime<Utc>),
    /// The check no longer owns the idle lock. Nothing was done.
    Superseded,
}

// =============================================================================
// Controller
// =============================================================================

/// Decides when the worker process has been idle long enough to stop.
pub struct WorkerIdleController<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    locks: L,
    activity: A,
    pool: P,
    queue: Q,
    config: IdleConfig,
}

impl<L, A, P, Q> Clone for WorkerIdleController<L, A, P, Q>
where
    L: DistributedLock + Clone,
    A: ActivityStore + Clone,
    P: WorkerPool + Clone,
    Q: TaskQueue + Clone,
{
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            activity: self.activity.clone(),
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
        }
    }
}

impl<L, A, P, Q> WorkerIdleController<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    pub fn new(locks: L, activity: A, pool: P, queue: Q, config: IdleConfig) -> Self {
        Self {
            locks,
            activity,
            pool,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &IdleConfig {
        &self.config
    }

    pub async fn record_activity(&self) -> Result<WorkerState, AppError> {
        self.record_activity_at(Utc::now()).await
    }

    /// Records task activity at `now` and schedules an idle check if none is pending.
    pub async fn record_activity_at(&self, now: DateTime<Utc>) -> Result<WorkerState, AppError> {
        self.activity.record_activity(now).await?;

        // A held lock means a check is already scheduled and will see `now`.
        let Some(holder) = self.locks.acquire(&self.config.lock_key).await? else {
            self.activity
                .set_state(WorkerState::PendingShutdown)
                .await?;
            return Ok(WorkerState::PendingShutdown);
        };

        let check_at = now + self.config.idle_period;
        if let Err(e) = self.schedule_check(holder.clone(), check_at).await {
            // Without a scheduled check nobody would ever release the lock.
            if let Err(release_err) = self.locks.release(&self.config.lock_key, &holder).await {
                warn!(error = %release_err, "Failed to release idle lock after scheduling error");
            }
            self.activity.set_state(WorkerState::Active).await?;
            return Err(e);
        }

        self.activity
            .set_state(WorkerState::PendingShutdown)
            .await?;
        debug!(%check_at, "Idle check scheduled");
        Ok(WorkerState::PendingShutdown)
    }

    pub async fn idle_check(&self, holder: &LockHolder) -> Result<IdleCheckOutcome, AppError> {
        self.idle_check_at(Utc::now(), holder).await
    }

    /// Runs a scheduled idle check as of `now`.
    ///
    /// A missing activity timestamp counts as activity at `now`.
    pub async fn idle_check_at(
        &self,
        now: DateTime<Utc>,
        holder: &LockHolder,
    ) -> Result<IdleCheckOutcome, AppError> {
        let last_activity = self.activity.last_activity().await?.unwrap_or(now);
        let elapsed = now - last_activity;

        if elapsed < self.config.idle_period {
            let check_at = last_activity + self.config.idle_period;
            self.schedule_check(holder.clone(), check_at).await?;
            debug!(%check_at, "Worker active since last check, rescheduled");
            return Ok(IdleCheckOutcome::Rescheduled(check_at));
        }

        if !self.locks.release(&self.config.lock_key, holder).await? {
            warn!(holder = %holder, "Idle lock is no longer held by this check, skipping");
            return Ok(IdleCheckOutcome::Superseded);
        }

        let counts = self.pool.task_counts().await?;
        if counts.is_idle() {
            info!(idle_seconds = elapsed.num_seconds(), "Worker idle, shutting down");
            self.pool.shutdown().await?;
            self.activity.set_state(WorkerState::Stopped).await?;
            Ok(IdleCheckOutcome::Stopped)
        } else {
            info!(
                scheduled = counts.scheduled,
                reserved = counts.reserved,
                active = counts.active,
                "Idle period elapsed but work is outstanding"
            );
            self.activity.set_state(WorkerState::Active).await?;
            Ok(IdleCheckOutcome::Busy(counts))
        }
    }

    pub async fn state(&self) -> Result<WorkerState, AppError> {
        self.activity.state().await
    }

    async fn schedule_check(
        &self,
        holder: LockHolder,
        at: DateTime<Utc>,
    ) -> Result<Task, AppError> {
        let request = CreateTaskRequest::new(TaskKind::IdleCheck { holder })
            .with_run_at(at)
            .with_max_retries(0);
        self.queue.create_task(request).await
    }
}

impl<L, A, P, Q> TaskHandler for WorkerIdleController<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    async fn handle(&self, task: &Task) -> Result<(), AppError> {
        match &task.kind {
            TaskKind::IdleCheck { holder } => self.idle_check(holder).await.map(|_| ()),
            other => Err(AppError::Generic(format!(
                "idle controller cannot handle {} tasks",
                other.as_str()
            ))),
        }
    }
}

/// Records activity when a counted task is accepted and again when it finishes.
pub struct ActivityInterceptor<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    controller: WorkerIdleController<L, A, P, Q>,
}

impl<L, A, P, Q> ActivityInterceptor<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    pub fn new(controller: WorkerIdleController<L, A, P, Q>) -> Self {
        Self { controller }
    }
}

impl<L, A, P, Q> TaskInterceptor for ActivityInterceptor<L, A, P, Q>
where
    L: DistributedLock,
    A: ActivityStore,
    P: WorkerPool,
    Q: TaskQueue,
{
    async fn before_task(&self, task: &Task) -> Result<(), AppError> {
        if task.kind.counts_as_activity() {
            self.controller.record_activity().await?;
        }
        Ok(())
    }

    async fn after_task(&self, task: &Task) -> Result<(), AppError> {
        if task.kind.counts_as_activity() {
            self.controller.record_activity().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Worker pool view
// =============================================================================

/// A [`WorkerPool`] backed by the task queue and a process controller.
#[derive(Clone)]
pub struct QueueWorkerPool<Q, C>
where
    Q: TaskQueue,
    C: ProcessControl,
{
    queue: Q,
    control: C,
}

impl<Q, C> QueueWorkerPool<Q, C>
where
    Q: TaskQueue,
    C: ProcessControl,
{
    pub fn new(queue: Q, control: C) -> Self {
        Self { queue, control }
    }
}

impl<Q, C> WorkerPool for QueueWorkerPool<Q, C>
where
    Q: TaskQueue,
    C: ProcessControl,
{
    async fn task_counts(&self) -> Result<TaskCounts, AppError> {
        self.queue.task_counts().await
    }

    async fn shutdown(&self) -> Result<(), AppError> {
        self.control.stop().await
    }
}
