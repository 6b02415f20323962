//! Worker service for processing tasks from the queue.
//!
//! This module provides the [`WorkerService`] that polls for due tasks and
//! hands them to a [`TaskHandler`], running a [`TaskInterceptor`] before and
//! after every accepted task.
//!
//! # Architecture
//!
//! The worker follows a poll-based model:
//! ```text
//! loop {
//!     1. Check for cancellation
//!     2. Claim next due task (SELECT FOR UPDATE SKIP LOCKED)
//!     3. Run the interceptor (activity tracking)
//!     4. Dispatch the task to its handler
//!     5. Run the interceptor again once the handler returns
//!     6. Update task status (completed/failed)
//!     7. If no tasks are due, sleep for poll_interval
//! }
//! ```
//!
//! # Graceful Shutdown
//!
//! On cancellation token trigger:
//! - Stops claiming new tasks
//! - Lets the current task finish
//! - Releases any claimed tasks back to the queue
//!
//! # Example
//!
//! ```ignore
//! use discoverer_core::worker::{WorkerService, TaskRouter, TracingWorkerReporter};
//! use discoverer_core::task::WorkerConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! let handler = TaskRouter::new(dataset_cache, idle_controller.clone());
//! let interceptor = ActivityInterceptor::new(idle_controller);
//! let worker = WorkerService::new(queue, handler, interceptor, WorkerConfig::default());
//!
//! worker.run(CancellationToken::new(), &TracingWorkerReporter).await?;
//! ```

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dataset::{ArtifactStatus, DatasetCache};
use crate::error::AppError;
use crate::task::{Task, TaskKind, WorkerConfig};
use crate::traits::{
    ArtifactSink, ArtifactStore, DistributedLock, PortalStore, ProcessControl, PublicationStore,
    TaskQueue,
};

// =============================================================================
// Handler and interceptor traits
// =============================================================================

/// Executes one claimed task.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Runs around every accepted task, whatever its kind.
pub trait TaskInterceptor: Send + Sync {
    fn before_task(&self, task: &Task) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Runs once the handler returned, whether it succeeded or not.
    fn after_task(&self, task: &Task) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Interceptor that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInterceptor;

impl TaskInterceptor for NoopInterceptor {
    async fn before_task(&self, _task: &Task) -> Result<(), AppError> {
        Ok(())
    }

    async fn after_task(&self, _task: &Task) -> Result<(), AppError> {
        Ok(())
    }
}

/// Sends idle checks to one handler and everything else to another.
pub struct TaskRouter<D, I>
where
    D: TaskHandler,
    I: TaskHandler,
{
    datasets: D,
    idle: I,
}

impl<D, I> TaskRouter<D, I>
where
    D: TaskHandler,
    I: TaskHandler,
{
    pub fn new(datasets: D, idle: I) -> Self {
        Self { datasets, idle }
    }
}

impl<D, I> TaskHandler for TaskRouter<D, I>
where
    D: TaskHandler,
    I: TaskHandler,
{
    async fn handle(&self, task: &Task) -> Result<(), AppError> {
        match task.kind {
            TaskKind::IdleCheck { .. } => self.idle.handle(task).await,
            TaskKind::BuildDataset { .. } | TaskKind::PublishIndex { .. } => {
                self.datasets.handle(task).await
            }
        }
    }
}

impl<P, S, A, L, K> TaskHandler for DatasetCache<P, S, A, L, K>
where
    P: PortalStore + Clone,
    S: PublicationStore,
    A: ArtifactStore,
    L: DistributedLock,
    K: ArtifactSink,
{
    async fn handle(&self, task: &Task) -> Result<(), AppError> {
        match &task.kind {
            TaskKind::BuildDataset { request } => {
                let artifact = self.get_or_export(request).await?;
                if artifact.status == ArtifactStatus::Building {
                    debug!(task_id = %task.id, "Dataset is being built by another worker");
                }
                Ok(())
            }
            TaskKind::PublishIndex { name } => self.tokens().publish(name).await.map(|_| ()),
            TaskKind::IdleCheck { .. } => Err(AppError::Generic(
                "dataset cache cannot handle idle_check tasks".to_string(),
            )),
        }
    }
}

// =============================================================================
// Local process control
// =============================================================================

/// Process control for a worker running inside the current process.
///
/// Stopping cancels the token the worker loop runs under.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessControl {
    token: CancellationToken,
}

impl LocalProcessControl {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl ProcessControl for LocalProcessControl {
    async fn ensure_running(&self) -> Result<(), AppError> {
        if self.token.is_cancelled() {
            return Err(AppError::Generic(
                "local worker has been stopped and cannot be restarted".to_string(),
            ));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AppError> {
        self.token.cancel();
        Ok(())
    }
}

// =============================================================================
// Worker Events
// =============================================================================

/// Events emitted by the worker during operation.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    /// Worker started and is ready to process tasks.
    Started { worker_id: &'a str },
    /// Worker is polling for new tasks.
    Polling,
    /// Worker claimed a task.
    TaskClaimed { task: &'a Task },
    /// Task completed successfully.
    TaskCompleted { task_id: Uuid, kind: &'a str },
    /// Task failed with error.
    TaskFailed {
        task_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    /// Worker is shutting down.
    ShuttingDown {
        worker_id: &'a str,
        tasks_released: u64,
    },
    /// Worker stopped.
    Stopped { worker_id: &'a str },
}

// =============================================================================
// Worker Reporter Trait
// =============================================================================

/// Trait for reporting worker events.
pub trait WorkerReporter: Send + Sync {
    /// Called when a worker event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Silent worker reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentWorkerReporter;

impl WorkerReporter for SilentWorkerReporter {}

/// Tracing-based worker reporter for CLI/server logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                info!(worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                debug!("Polling for tasks...");
            }
            WorkerEvent::TaskClaimed { task } => {
                info!(task_id = %task.id, kind = task.kind.as_str(), "Task claimed");
            }
            WorkerEvent::TaskCompleted { task_id, kind } => {
                info!(%task_id, kind, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                error,
                will_retry,
            } => {
                if will_retry {
                    warn!(%task_id, %error, "Task failed, will retry");
                } else {
                    error!(%task_id, %error, "Task permanently failed");
                }
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                tasks_released,
            } => {
                info!(worker_id, tasks_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                info!(worker_id, "Worker stopped");
            }
        }
    }
}

// =============================================================================
// Worker Service
// =============================================================================

/// Worker service that processes tasks from the queue.
pub struct WorkerService<Q, H, I>
where
    Q: TaskQueue,
    H: TaskHandler,
    I: TaskInterceptor,
{
    queue: Q,
    handler: H,
    interceptor: I,
    config: WorkerConfig,
}

impl<Q, H, I> WorkerService<Q, H, I>
where
    Q: TaskQueue,
    H: TaskHandler,
    I: TaskInterceptor,
{
    /// Create a new worker service.
    pub fn new(queue: Q, handler: H, interceptor: I, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            interceptor,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker until cancelled.
    pub async fn run<WR>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError>
    where
        WR: WorkerReporter,
    {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.queue.claim_task(&self.config.worker_id).await {
                Ok(Some(task)) => {
                    reporter.report(WorkerEvent::TaskClaimed { task: &task });
                    self.process_task(&task, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to claim task");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release any tasks this worker claimed
        let released = match self.queue.release_worker_tasks(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to release claimed tasks");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            tasks_released: released,
        });

        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Claims and processes due tasks until none is left. Returns how many ran.
    pub async fn drain<WR>(&self, reporter: &WR) -> Result<usize, AppError>
    where
        WR: WorkerReporter,
    {
        let mut processed = 0;
        while let Some(task) = self.queue.claim_task(&self.config.worker_id).await? {
            reporter.report(WorkerEvent::TaskClaimed { task: &task });
            self.process_task(&task, reporter).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Process a single claimed task.
    async fn process_task<WR>(&self, task: &Task, reporter: &WR)
    where
        WR: WorkerReporter,
    {
        if let Err(e) = self.interceptor.before_task(task).await {
            warn!(task_id = %task.id, error = %e, "Task interceptor failed");
        }

        let result = self.handler.handle(task).await;

        if let Err(e) = self.interceptor.after_task(task).await {
            warn!(task_id = %task.id, error = %e, "Task interceptor failed after task");
        }

        match result {
            Ok(()) => {
                reporter.report(WorkerEvent::TaskCompleted {
                    task_id: task.id,
                    kind: task.kind.as_str(),
                });

                if let Err(e) = self.queue.complete_task(task.id).await {
                    error!(task_id = %task.id, error = %e, "Failed to mark task as completed");
                }
            }
            Err(e) => {
                let error_msg = e.to_string();
                let can_retry = task.can_retry() && e.is_retryable();

                reporter.report(WorkerEvent::TaskFailed {
                    task_id: task.id,
                    error: &error_msg,
                    will_retry: can_retry,
                });

                let next_retry = if can_retry {
                    Some(task.calculate_next_retry(&self.config.retry_config))
                } else {
                    None
                };

                if let Err(e) = self.queue.fail_task(task.id, &error_msg, next_retry).await {
                    error!(task_id = %task.id, error = %e, "Failed to mark task as failed");
                }
            }
        }
    }
}
