//! Integration tests for the worker idle-timeout controller.

use chrono::{TimeDelta, Utc};
use discoverer_core::traits::{ActivityStore, DistributedLock};
use discoverer_core::{IDLE_LOCK_KEY, IdleCheckOutcome, LockHolder, TaskCounts, TaskKind, WorkerState};

use super::common::{Harness, RecordingPool};

fn scheduled_checks(harness: &Harness) -> Vec<(LockHolder, chrono::DateTime<Utc>)> {
    harness
        .queue
        .tasks()
        .into_iter()
        .filter_map(|task| match task.kind {
            TaskKind::IdleCheck { holder } => Some((holder, task.run_at)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_shutdown_after_idle_period() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    let controller = harness.controller(pool.clone());
    let t0 = Utc::now();

    let state = controller.record_activity_at(t0).await.unwrap();
    assert_eq!(state, WorkerState::PendingShutdown);

    let checks = scheduled_checks(&harness);
    assert_eq!(checks.len(), 1);
    let (holder, run_at) = checks[0].clone();
    assert_eq!(run_at, t0 + TimeDelta::minutes(5));

    let outcome = controller.idle_check_at(run_at, &holder).await.unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Stopped);
    assert_eq!(pool.shutdowns(), 1);
    assert_eq!(controller.state().await.unwrap(), WorkerState::Stopped);
    assert!(harness.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_further_activity_does_not_schedule_more_checks() {
    let harness = Harness::new();
    let controller = harness.controller(RecordingPool::new());
    let t0 = Utc::now();

    controller.record_activity_at(t0).await.unwrap();
    let state = controller
        .record_activity_at(t0 + TimeDelta::minutes(1))
        .await
        .unwrap();

    // The first check is still pending, and the status says so.
    assert_eq!(state, WorkerState::PendingShutdown);
    assert_eq!(controller.state().await.unwrap(), WorkerState::PendingShutdown);
    assert_eq!(scheduled_checks(&harness).len(), 1);
    let locks = harness.locks.list().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].key, IDLE_LOCK_KEY);
}

#[tokio::test]
async fn test_repeated_check_does_not_shut_down_twice() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    let controller = harness.controller(pool.clone());
    let t0 = Utc::now();

    controller.record_activity_at(t0).await.unwrap();
    let (holder, run_at) = scheduled_checks(&harness)[0].clone();

    let outcome = controller.idle_check_at(run_at, &holder).await.unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Stopped);

    // Same check delivered again with no activity in between.
    let outcome = controller
        .idle_check_at(run_at + TimeDelta::minutes(1), &holder)
        .await
        .unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Superseded);
    assert_eq!(pool.shutdowns(), 1);
    assert_eq!(controller.state().await.unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_check_with_foreign_holder_is_skipped() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    let controller = harness.controller(pool.clone());
    let t0 = Utc::now();

    controller.record_activity_at(t0).await.unwrap();
    let (holder, run_at) = scheduled_checks(&harness)[0].clone();

    let stranger = LockHolder::generate();
    let outcome = controller.idle_check_at(run_at, &stranger).await.unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Superseded);
    assert_eq!(pool.shutdowns(), 0);
    assert_eq!(harness.locks.list().await.unwrap()[0].holder, holder);
}

#[tokio::test]
async fn test_check_reschedules_after_recent_activity() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    let controller = harness.controller(pool.clone());
    let t0 = Utc::now();

    controller.record_activity_at(t0).await.unwrap();
    controller
        .record_activity_at(t0 + TimeDelta::minutes(3))
        .await
        .unwrap();
    let (holder, run_at) = scheduled_checks(&harness)[0].clone();

    let outcome = controller.idle_check_at(run_at, &holder).await.unwrap();
    let expected = t0 + TimeDelta::minutes(8);
    assert_eq!(outcome, IdleCheckOutcome::Rescheduled(expected));
    assert_eq!(pool.shutdowns(), 0);

    let checks = scheduled_checks(&harness);
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[1], (holder.clone(), expected));

    // The lock is still held by the rescheduled check.
    assert_eq!(harness.locks.list().await.unwrap()[0].holder, holder);

    let outcome = controller.idle_check_at(expected, &holder).await.unwrap();
    assert_eq!(outcome, IdleCheckOutcome::Stopped);
    assert_eq!(pool.shutdowns(), 1);
}

#[tokio::test]
async fn test_outstanding_work_prevents_shutdown() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    pool.set_counts(TaskCounts {
        scheduled: 0,
        reserved: 1,
        active: 0,
    });
    let controller = harness.controller(pool.clone());
    let t0 = Utc::now();

    controller.record_activity_at(t0).await.unwrap();
    let (holder, run_at) = scheduled_checks(&harness)[0].clone();

    let outcome = controller.idle_check_at(run_at, &holder).await.unwrap();
    assert!(matches!(outcome, IdleCheckOutcome::Busy(c) if c.reserved == 1));
    assert_eq!(pool.shutdowns(), 0);
    assert_eq!(controller.state().await.unwrap(), WorkerState::Active);

    // The lock was released, so the next activity schedules a fresh check.
    assert!(harness.locks.list().await.unwrap().is_empty());
    let state = controller
        .record_activity_at(run_at + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(state, WorkerState::PendingShutdown);
    assert_eq!(scheduled_checks(&harness).len(), 2);
}

#[tokio::test]
async fn test_missing_activity_counts_as_now() {
    let harness = Harness::new();
    let pool = RecordingPool::new();
    let controller = harness.controller(pool.clone());
    let now = Utc::now();
    let holder = harness.locks.acquire(IDLE_LOCK_KEY).await.unwrap().unwrap();

    assert!(harness.activity.last_activity().await.unwrap().is_none());
    let outcome = controller.idle_check_at(now, &holder).await.unwrap();

    assert_eq!(
        outcome,
        IdleCheckOutcome::Rescheduled(now + TimeDelta::minutes(5))
    );
    assert_eq!(pool.shutdowns(), 0);
}
