//! Integration tests for the portal, publication, lock, artifact and
//! activity repositories.

use chrono::{TimeDelta, Utc};
use discoverer_core::dataset::{ArtifactStatus, DatasetAddress};
use discoverer_core::idle::WorkerState;
use discoverer_core::traits::{
    ActivityStore, ArtifactStore, DistributedLock, PortalStore, PublicationStore,
};
use discoverer_core::{
    DatasetFormat, GeoPoint, Observation, RejectionReason, VersionTokenCache,
};
use discoverer_db::{
    ActivityRepository, ArtifactRepository, LockRepository, PortalRepository,
    PublicationRepository,
};
use futures::StreamExt;

use crate::integration::common::setup_test_db;

// =============================================================================
// Portals
// =============================================================================

#[tokio::test]
async fn test_merge_end_to_end_history() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);
    let at = GeoPoint::new(45_000_000, -120_000_000);

    let first = repo
        .merge_batch(&[Observation::new("A", at.lat_e6, at.lng_e6)])
        .await
        .expect("merge should succeed");
    assert_eq!(first.inserted, 1);

    let again = repo
        .merge_batch(&[Observation::new("A", at.lat_e6, at.lng_e6)])
        .await
        .unwrap();
    assert_eq!(again.modified, 0);
    assert_eq!(again.unchanged, 1);

    let renamed = repo
        .merge_batch(&[Observation::new("A2", at.lat_e6, at.lng_e6)])
        .await
        .unwrap();
    assert_eq!(renamed.modified, 1);

    let records = repo.find_at(at).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "A2");
    assert_eq!(records[0].history.len(), 2);
    assert_eq!(records[0].history[0].name, "A");
    assert_eq!(records[0].content_key, records[0].history[1].content_key);
}

#[tokio::test]
async fn test_guid_match_follows_moved_portal() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);

    repo.merge_batch(&[
        Observation::new("Statue", 10, 10).with_guid("s.16"),
        Observation::new("Statue", 20, 20).with_guid("s.16"),
    ])
    .await
    .unwrap();

    assert_eq!(repo.count().await.unwrap(), 1);
    let record = repo.get_by_guid("s.16").await.unwrap().unwrap();
    assert_eq!(record.location, GeoPoint::new(20, 20));
    assert_eq!(record.history.len(), 2);
    assert!(repo.find_at(GeoPoint::new(10, 10)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_rejected_and_batch_continues() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);

    repo.merge_batch(&[Observation::new("Gate", 9, 9).with_guid("g1.16")])
        .await
        .unwrap();

    let result = repo
        .merge_batch(&[
            Observation::new("Gate", 9, 9).with_guid("g2.16"),
            Observation::new("Other", 1, 1),
        ])
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].index, 0);
    assert_eq!(
        result.rejected[0].reason,
        RejectionReason::GuidMismatch {
            existing_guid: "g1.16".to_string()
        }
    );
    assert!(repo.get_by_guid("g2.16").await.unwrap().is_none());
}

#[tokio::test]
async fn test_guid_observation_adopts_guidless_record() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);

    repo.merge_batch(&[Observation::new("Bench", 7, 7)])
        .await
        .unwrap();
    let result = repo
        .merge_batch(&[Observation::new("Bench", 7, 7).with_guid("b.16")])
        .await
        .unwrap();

    assert_eq!(result.modified, 1);
    assert_eq!(repo.count().await.unwrap(), 1);

    // A later guid-less observation at the same spot no longer matches it.
    let result = repo
        .merge_batch(&[Observation::new("Bench", 7, 7)])
        .await
        .unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(repo.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_merges_on_one_identity_serialize() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);

    let merges = (0..8).map(|i| {
        let repo = repo.clone();
        tokio::spawn(async move {
            repo.merge_batch(&[Observation::new(format!("Name {}", i), 3, 3).with_guid("c.16")])
                .await
        })
    });
    for handle in futures::future::join_all(merges).await {
        handle.unwrap().expect("merge should succeed");
    }

    assert_eq!(repo.count().await.unwrap(), 1);
    let record = repo.get_by_guid("c.16").await.unwrap().unwrap();
    assert_eq!(record.history.len(), 8);
}

#[tokio::test]
async fn test_list_stream_and_guid_index() {
    let (pool, _container) = setup_test_db().await;
    let repo = PortalRepository::new(pool);
    let t0 = Utc::now() - TimeDelta::days(2);

    repo.merge_batch(&[
        Observation::new("Newer", 2, 2)
            .with_guid("n.16")
            .with_observed_at(t0 + TimeDelta::days(1)),
        Observation::new("Older", 1, 1).with_observed_at(t0),
    ])
    .await
    .unwrap();

    let names: Vec<String> = repo
        .list_stream()
        .map(|r| r.unwrap().name)
        .collect()
        .await;
    assert_eq!(names, vec!["Older".to_string(), "Newer".to_string()]);

    let index = repo.guid_index().await.unwrap();
    assert_eq!(index.len(), 1);
    assert!(index.contains_key("n.16"));
}

// =============================================================================
// Publications
// =============================================================================

#[tokio::test]
async fn test_publish_overwrites_previous_token() {
    let (pool, _container) = setup_test_db().await;
    let portals = PortalRepository::new(pool.clone());
    let publications = PublicationRepository::new(pool);
    let tokens = VersionTokenCache::new(portals.clone(), publications.clone());

    assert!(publications.get("portal-index").await.unwrap().is_none());
    let first = tokens.get_or_publish("portal-index").await.unwrap();
    assert_eq!(first.item_count, 0);

    portals
        .merge_batch(&[Observation::new("A", 1, 1).with_guid("a.16")])
        .await
        .unwrap();
    let second = tokens.publish("portal-index").await.unwrap();
    assert_ne!(second.token.token, first.token);

    let stored = publications.get("portal-index").await.unwrap().unwrap();
    assert_eq!(stored.token.token, second.token.token);
    assert_eq!(stored.token.item_count, 1);
    assert!(stored.document.keys.contains_key("a.16"));
}

// =============================================================================
// Locks
// =============================================================================

#[tokio::test]
async fn test_lock_is_exclusive_and_holder_checked() {
    let (pool, _container) = setup_test_db().await;
    let locks = LockRepository::new(pool);

    let holder = locks.acquire("idle-lock").await.unwrap().expect("first acquire wins");
    assert!(locks.acquire("idle-lock").await.unwrap().is_none());

    let stranger = discoverer_core::LockHolder::generate();
    assert!(!locks.release("idle-lock", &stranger).await.unwrap());
    assert_eq!(locks.list().await.unwrap().len(), 1);

    assert!(locks.release("idle-lock", &holder).await.unwrap());
    assert!(locks.list().await.unwrap().is_empty());
    assert!(locks.acquire("idle-lock").await.unwrap().is_some());
}

#[tokio::test]
async fn test_force_release_clears_orphan() {
    let (pool, _container) = setup_test_db().await;
    let locks = LockRepository::new(pool);

    let holder = locks.acquire("dataset-build:x:kml:0").await.unwrap().unwrap();
    let entries = locks.list().await.unwrap();
    assert_eq!(entries[0].holder, holder);

    assert!(locks.force_release("dataset-build:x:kml:0").await.unwrap());
    assert!(!locks.force_release("dataset-build:x:kml:0").await.unwrap());
}

// =============================================================================
// Artifacts
// =============================================================================

fn address() -> DatasetAddress {
    DatasetAddress {
        name: "portal-index".to_string(),
        format: DatasetFormat::Kml,
        config_hash: "0".repeat(64),
    }
}

#[tokio::test]
async fn test_artifact_build_lifecycle() {
    let (pool, _container) = setup_test_db().await;
    let artifacts = ArtifactRepository::new(pool);
    let address = address();

    let building = artifacts.begin_build(&address, "t1").await.unwrap();
    assert_eq!(building.status, ArtifactStatus::Building);
    assert!(building.payload_ref.is_none());

    let ready = artifacts
        .complete_build(&address, "t1", "portal-index/0/t1.kml")
        .await
        .unwrap();
    assert_eq!(ready.status, ArtifactStatus::Ready);
    assert_eq!(ready.payload_ref.as_deref(), Some("portal-index/0/t1.kml"));

    let found = artifacts.find(&address).await.unwrap().unwrap();
    assert_eq!(found, ready);
    assert_eq!(artifacts.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_restores_previous_ready_row() {
    let (pool, _container) = setup_test_db().await;
    let artifacts = ArtifactRepository::new(pool);
    let address = address();

    artifacts.begin_build(&address, "t1").await.unwrap();
    let ready = artifacts
        .complete_build(&address, "t1", "portal-index/0/t1.kml")
        .await
        .unwrap();

    artifacts.begin_build(&address, "t2").await.unwrap();
    let restored = artifacts.rollback_build(&address).await.unwrap().unwrap();

    assert_eq!(restored.status, ArtifactStatus::Ready);
    assert_eq!(restored.source_token, "t1");
    assert_eq!(restored.payload_ref, ready.payload_ref);
}

#[tokio::test]
async fn test_rollback_of_first_build_deletes_row() {
    let (pool, _container) = setup_test_db().await;
    let artifacts = ArtifactRepository::new(pool);
    let address = address();

    artifacts.begin_build(&address, "t1").await.unwrap();
    assert!(artifacts.rollback_build(&address).await.unwrap().is_none());
    assert!(artifacts.find(&address).await.unwrap().is_none());
}

#[tokio::test]
async fn test_complete_without_build_fails() {
    let (pool, _container) = setup_test_db().await;
    let artifacts = ArtifactRepository::new(pool);

    let result = artifacts.complete_build(&address(), "t1", "ref").await;
    assert!(result.is_err());
}

// =============================================================================
// Activity
// =============================================================================

#[tokio::test]
async fn test_activity_roundtrip() {
    let (pool, _container) = setup_test_db().await;
    let activity = ActivityRepository::new(pool);

    assert!(activity.last_activity().await.unwrap().is_none());
    assert_eq!(activity.state().await.unwrap(), WorkerState::Idle);

    let at = Utc::now();
    activity.record_activity(at).await.unwrap();
    activity.set_state(WorkerState::PendingShutdown).await.unwrap();

    let stored = activity.last_activity().await.unwrap().unwrap();
    assert!((stored - at).num_milliseconds().abs() < 1);
    assert_eq!(activity.state().await.unwrap(), WorkerState::PendingShutdown);
}
