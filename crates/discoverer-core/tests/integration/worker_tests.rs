//! Integration tests for the task worker wired to the cache and idle controller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use discoverer_core::memory::{MemoryActivityStore, MemoryLockStore, MemoryTaskQueue};
use discoverer_core::traits::{ActivityStore, DistributedLock, ProcessControl, TaskQueue};
use discoverer_core::{
    ActivityInterceptor, AppError, ArtifactState, CreateTaskRequest, DatasetFormat,
    DatasetRequest, IdleCheckOutcome, IdleConfig, LocalProcessControl, LockHolder,
    NoopInterceptor, Observation, QueueWorkerPool, SilentWorkerReporter, Task, TaskHandler,
    TaskKind, TaskRouter, TaskStatus, WorkerConfig, WorkerIdleController, WorkerService,
    WorkerState,
};
use tokio_util::sync::CancellationToken;

use super::common::{Harness, INDEX};

type LocalController = WorkerIdleController<
    MemoryLockStore,
    MemoryActivityStore,
    QueueWorkerPool<MemoryTaskQueue, LocalProcessControl>,
    MemoryTaskQueue,
>;

fn local_controller(harness: &Harness, control: LocalProcessControl) -> LocalController {
    WorkerIdleController::new(
        harness.locks.clone(),
        harness.activity.clone(),
        QueueWorkerPool::new(harness.queue.clone(), control),
        harness.queue.clone(),
        IdleConfig::default(),
    )
}

#[tokio::test]
async fn test_build_task_records_activity_and_builds() {
    let harness = Harness::new();
    harness
        .portals()
        .ingest(vec![Observation::new("A", 45_000_000, -120_000_000)])
        .await
        .unwrap();

    let control = LocalProcessControl::new(CancellationToken::new());
    let controller = local_controller(&harness, control.clone());
    let worker = WorkerService::new(
        harness.queue.clone(),
        TaskRouter::new(harness.cache(), controller.clone()),
        ActivityInterceptor::new(controller.clone()),
        WorkerConfig::default(),
    );

    let request = DatasetRequest::new(INDEX, DatasetFormat::Kml);
    harness
        .queue
        .create_task(CreateTaskRequest::new(TaskKind::BuildDataset {
            request: request.clone(),
        }))
        .await
        .unwrap();

    let processed = worker.drain(&SilentWorkerReporter).await.unwrap();
    assert_eq!(processed, 1);

    let lookup = harness.cache().lookup(&request).await.unwrap();
    assert_eq!(lookup.state, ArtifactState::Ready);
    assert!(harness.activity.last_activity().await.unwrap().is_some());

    // The idle check is scheduled one period out and was not claimed.
    let checks: Vec<Task> = harness
        .queue
        .tasks()
        .into_iter()
        .filter(|t| matches!(t.kind, TaskKind::IdleCheck { .. }))
        .collect();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].status, TaskStatus::Pending);

    // Once the period has passed the check stops the local worker.
    let TaskKind::IdleCheck { holder } = checks[0].kind.clone() else {
        unreachable!();
    };
    let outcome = controller
        .idle_check_at(Utc::now() + TimeDelta::minutes(6), &holder)
        .await
        .unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Stopped);
    assert!(control.token().is_cancelled());
}

#[tokio::test]
async fn test_run_exits_when_stopped() {
    let harness = Harness::new();
    let token = CancellationToken::new();
    let control = LocalProcessControl::new(token.clone());
    let controller = local_controller(&harness, control.clone());
    let worker = WorkerService::new(
        harness.queue.clone(),
        TaskRouter::new(harness.cache(), controller.clone()),
        NoopInterceptor,
        WorkerConfig::default().with_poll_interval(std::time::Duration::from_millis(10)),
    );

    let handle = tokio::spawn(async move { worker.run(token, &SilentWorkerReporter).await });
    control.stop().await.unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

/// Handler whose task overlaps an idle check run by another worker.
struct OverlappingCheckHandler {
    harness: Harness,
    controller: LocalController,
    outcome: Arc<Mutex<Option<IdleCheckOutcome>>>,
}

impl TaskHandler for OverlappingCheckHandler {
    async fn handle(&self, _task: &Task) -> Result<(), AppError> {
        let holder = self
            .harness
            .queue
            .tasks()
            .into_iter()
            .find_map(|t| match t.kind {
                TaskKind::IdleCheck { holder } => Some(holder),
                _ => None,
            })
            .ok_or_else(|| AppError::Generic("no idle check scheduled".to_string()))?;
        let outcome = self
            .controller
            .idle_check_at(Utc::now() + TimeDelta::minutes(6), &holder)
            .await?;
        *self.outcome.lock().unwrap() = Some(outcome);
        Ok(())
    }
}

#[tokio::test]
async fn test_finished_task_schedules_new_check_after_busy_check() {
    let harness = Harness::new();
    let control = LocalProcessControl::new(CancellationToken::new());
    let controller = local_controller(&harness, control.clone());
    let outcome = Arc::new(Mutex::new(None));
    let worker = WorkerService::new(
        harness.queue.clone(),
        OverlappingCheckHandler {
            harness: harness.clone(),
            controller: controller.clone(),
            outcome: outcome.clone(),
        },
        ActivityInterceptor::new(controller.clone()),
        WorkerConfig::default(),
    );

    harness
        .queue
        .create_task(CreateTaskRequest::new(TaskKind::PublishIndex {
            name: INDEX.to_string(),
        }))
        .await
        .unwrap();
    assert_eq!(worker.drain(&SilentWorkerReporter).await.unwrap(), 1);

    // The overlapping check saw the running task and gave up the lock.
    let seen = outcome.lock().unwrap().take();
    assert!(matches!(seen, Some(IdleCheckOutcome::Busy(c)) if c.active == 1));

    // Finishing the task took the lock again and scheduled a fresh check.
    let holders: Vec<LockHolder> = harness
        .queue
        .tasks()
        .into_iter()
        .filter_map(|t| match t.kind {
            TaskKind::IdleCheck { holder } => Some(holder),
            _ => None,
        })
        .collect();
    assert_eq!(holders.len(), 2);
    let locks = harness.locks.list().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].holder, holders[1]);
    assert_ne!(holders[0], holders[1]);
    assert_eq!(controller.state().await.unwrap(), WorkerState::PendingShutdown);
    assert!(!control.token().is_cancelled());
}

/// Handler that fails with a retryable error a fixed number of times.
struct FlakyHandler {
    failures_left: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl TaskHandler for FlakyHandler {
    async fn handle(&self, _task: &Task) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AppError::NetworkError("connection reset".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_retryable_failure_is_rescheduled() {
    let queue = MemoryTaskQueue::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = WorkerService::new(
        queue.clone(),
        FlakyHandler {
            failures_left: AtomicUsize::new(1),
            calls: calls.clone(),
        },
        NoopInterceptor,
        WorkerConfig::default(),
    );

    let task = queue
        .create_task(CreateTaskRequest::new(TaskKind::PublishIndex {
            name: INDEX.to_string(),
        }))
        .await
        .unwrap();

    assert_eq!(worker.drain(&SilentWorkerReporter).await.unwrap(), 1);
    let task = queue.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.next_retry_at.unwrap() > Utc::now());

    // Not due yet, so a second drain does nothing.
    assert_eq!(worker.drain(&SilentWorkerReporter).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_permanently() {
    let queue = MemoryTaskQueue::new();
    let worker = WorkerService::new(
        queue.clone(),
        FlakyHandler {
            failures_left: AtomicUsize::new(1),
            calls: Arc::new(AtomicUsize::new(0)),
        },
        NoopInterceptor,
        WorkerConfig::default(),
    );

    let task = queue
        .create_task(
            CreateTaskRequest::new(TaskKind::PublishIndex {
                name: INDEX.to_string(),
            })
            .with_max_retries(0),
        )
        .await
        .unwrap();

    worker.drain(&SilentWorkerReporter).await.unwrap();
    let task = queue.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("Network error: connection reset"));
}
