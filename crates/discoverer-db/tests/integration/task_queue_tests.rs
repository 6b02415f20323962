//! Integration tests for TaskRepository.

use chrono::{TimeDelta, Utc};
use discoverer_core::traits::TaskQueue;
use discoverer_core::{
    CreateTaskRequest, DatasetFormat, DatasetRequest, LockHolder, TaskKind, TaskStatus,
};
use discoverer_db::TaskRepository;

use crate::integration::common::setup_test_db;

fn publish_task() -> CreateTaskRequest {
    CreateTaskRequest::new(TaskKind::PublishIndex {
        name: "portal-index".to_string(),
    })
}

#[tokio::test]
async fn test_create_and_claim() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    let created = queue.create_task(publish_task()).await.unwrap();
    assert_eq!(created.status, TaskStatus::Pending);
    assert_eq!(created.max_retries, 3);

    let claimed = queue.claim_task("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, created.id);
    assert_eq!(claimed.status, TaskStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(claimed.kind, created.kind);

    assert!(queue.claim_task("worker-2").await.unwrap().is_none());

    queue.complete_task(claimed.id).await.unwrap();
    let done = queue.get_task(claimed.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_future_task_is_not_claimed() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    queue
        .create_task(
            CreateTaskRequest::new(TaskKind::IdleCheck {
                holder: LockHolder::generate(),
            })
            .with_run_at(Utc::now() + TimeDelta::minutes(5)),
        )
        .await
        .unwrap();

    assert!(queue.claim_task("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_claims_take_distinct_tasks() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    for _ in 0..4 {
        queue.create_task(publish_task()).await.unwrap();
    }

    let claims = (0..4).map(|i| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.claim_task(&format!("worker-{}", i)).await })
    });
    let mut ids: Vec<_> = futures::future::join_all(claims)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().unwrap().id)
        .collect();
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn test_fail_with_retry_resets_to_pending() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    let task = queue.create_task(publish_task()).await.unwrap();
    queue.claim_task("worker-1").await.unwrap();

    let retry_at = Utc::now() + TimeDelta::minutes(1);
    queue
        .fail_task(task.id, "connection reset", Some(retry_at))
        .await
        .unwrap();

    let task = queue.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.worker_id.is_none());
    assert!(queue.claim_task("worker-1").await.unwrap().is_none());

    queue.fail_task(task.id, "fatal", None).await.unwrap();
    let task = queue.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_message.as_deref(), Some("fatal"));
}

#[tokio::test]
async fn test_release_worker_tasks() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    queue.create_task(publish_task()).await.unwrap();
    queue.create_task(publish_task()).await.unwrap();
    queue.claim_task("worker-1").await.unwrap();
    queue.claim_task("worker-1").await.unwrap();

    assert_eq!(queue.release_worker_tasks("worker-1").await.unwrap(), 2);
    assert_eq!(
        queue.list_tasks(Some(TaskStatus::Pending), 10).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_task_counts_exclude_idle_checks() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    queue
        .create_task(
            CreateTaskRequest::new(TaskKind::IdleCheck {
                holder: LockHolder::generate(),
            })
            .with_run_at(Utc::now() + TimeDelta::minutes(5)),
        )
        .await
        .unwrap();
    assert!(queue.task_counts().await.unwrap().is_idle());

    queue
        .create_task(publish_task().with_run_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    queue.create_task(publish_task()).await.unwrap();
    queue.create_task(publish_task()).await.unwrap();
    queue.claim_task("worker-1").await.unwrap();

    let counts = queue.task_counts().await.unwrap();
    assert_eq!(counts.scheduled, 1);
    assert_eq!(counts.reserved, 1);
    assert_eq!(counts.active, 1);
}

#[tokio::test]
async fn test_find_active_by_key() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);

    let request = DatasetRequest::new("portal-index", DatasetFormat::Csv);
    let key = request.address().unwrap().lock_key();
    assert!(queue.find_active_by_key(&key).await.unwrap().is_none());

    let task = queue
        .create_task(CreateTaskRequest::new(TaskKind::BuildDataset { request }))
        .await
        .unwrap();
    assert_eq!(task.dedup_key.as_deref(), Some(key.as_str()));

    let found = queue.find_active_by_key(&key).await.unwrap().unwrap();
    assert_eq!(found.id, task.id);

    queue.cancel_task(task.id).await.unwrap();
    assert!(queue.find_active_by_key(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_build_requests_share_one_task() {
    let (pool, _container) = setup_test_db().await;
    let queue = TaskRepository::new(pool);
    let request = DatasetRequest::new("portal-index", DatasetFormat::Kml);
    let key = request.address().unwrap().lock_key();

    let creates = (0..8).map(|_| {
        let queue = queue.clone();
        let request = request.clone();
        async move {
            queue
                .create_task(CreateTaskRequest::new(TaskKind::BuildDataset { request }))
                .await
        }
    });
    let tasks: Vec<_> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert!(tasks.iter().all(|t| t.id == tasks[0].id));
    let pending = queue
        .list_tasks(Some(TaskStatus::Pending), 50)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    // Once the task is done a new request queues a fresh one.
    queue.complete_task(tasks[0].id).await.unwrap();
    let next = queue
        .create_task(CreateTaskRequest::new(TaskKind::BuildDataset { request }))
        .await
        .unwrap();
    assert_ne!(next.id, tasks[0].id);
    assert_eq!(next.dedup_key.as_deref(), Some(key.as_str()));
}
