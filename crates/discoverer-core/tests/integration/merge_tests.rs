//! Integration tests for portal ingest and merge semantics.

use discoverer_core::memory::MemoryPortalStore;
use discoverer_core::traits::PortalStore;
use discoverer_core::{GeoPoint, Observation, RejectionReason};

use super::common::Harness;

#[tokio::test]
async fn test_end_to_end_history() {
    let harness = Harness::new();
    let service = harness.portals();

    let first = service
        .ingest(vec![Observation::new("A", 45_000_000, -120_000_000)])
        .await
        .unwrap();
    assert_eq!(first.result.inserted, 1);
    let records = harness.store.find_at(GeoPoint::new(45_000_000, -120_000_000)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].history.len(), 1);

    let again = service
        .ingest(vec![Observation::new("A", 45_000_000, -120_000_000)])
        .await
        .unwrap();
    assert_eq!(again.result.modified, 0);
    assert_eq!(again.result.unchanged, 1);

    let renamed = service
        .ingest(vec![Observation::new("A2", 45_000_000, -120_000_000)])
        .await
        .unwrap();
    assert_eq!(renamed.result.modified, 1);

    let records = harness.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "A2");
    assert_eq!(records[0].history.len(), 2);
    assert_eq!(records[0].history[0].name, "A");
}

#[tokio::test]
async fn test_resubmission_is_idempotent() {
    let store = MemoryPortalStore::new();
    let obs = Observation::new("Fountain", 1_000, 2_000).with_guid("f.16");

    store.merge_batch(std::slice::from_ref(&obs)).await.unwrap();
    let result = store.merge_batch(&[obs.clone(), obs]).await.unwrap();

    assert_eq!(result.modified, 0);
    assert_eq!(result.unchanged, 2);
    let record = store.get_by_guid("f.16").await.unwrap().unwrap();
    assert_eq!(record.history.len(), 1);
}

#[tokio::test]
async fn test_guid_follows_moved_portal() {
    let store = MemoryPortalStore::new();
    store
        .merge_batch(&[
            Observation::new("Statue", 10, 10).with_guid("s.16"),
            Observation::new("Statue", 20, 20).with_guid("s.16"),
        ])
        .await
        .unwrap();

    assert_eq!(store.count().await.unwrap(), 1);
    let record = store.get_by_guid("s.16").await.unwrap().unwrap();
    assert_eq!(record.location, GeoPoint::new(20, 20));
    assert_eq!(record.history.len(), 2);
}

#[tokio::test]
async fn test_guidless_observation_does_not_match_guid_record() {
    let store = MemoryPortalStore::new();
    store
        .merge_batch(&[Observation::new("Mural", 5, 5).with_guid("m.16")])
        .await
        .unwrap();

    let result = store
        .merge_batch(&[Observation::new("Mural", 5, 5)])
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(store.find_at(GeoPoint::new(5, 5)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_guid_observation_adopts_guidless_record() {
    let store = MemoryPortalStore::new();
    store
        .merge_batch(&[Observation::new("Bench", 7, 7)])
        .await
        .unwrap();

    let result = store
        .merge_batch(&[Observation::new("Bench", 7, 7).with_guid("b.16")])
        .await
        .unwrap();

    assert_eq!(result.modified, 1);
    assert_eq!(store.count().await.unwrap(), 1);
    let record = store.get_by_guid("b.16").await.unwrap().unwrap();
    assert_eq!(record.history.len(), 2);
}

#[tokio::test]
async fn test_conflict_rejected_without_affecting_batch() {
    let store = MemoryPortalStore::new();
    store
        .merge_batch(&[Observation::new("Gate", 9, 9).with_guid("g1.16")])
        .await
        .unwrap();

    let result = store
        .merge_batch(&[
            Observation::new("Other", 1, 1),
            Observation::new("Gate", 9, 9).with_guid("g2.16"),
            Observation::new("Third", 2, 2).with_guid("t.16"),
        ])
        .await
        .unwrap();

    assert_eq!(result.inserted, 2);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(result.rejected[0].index, 1);
    assert_eq!(result.rejected[0].guid.as_deref(), Some("g2.16"));
    assert_eq!(
        result.rejected[0].reason,
        RejectionReason::GuidMismatch {
            existing_guid: "g1.16".to_string()
        }
    );
    assert!(store.get_by_guid("g2.16").await.unwrap().is_none());
}

#[tokio::test]
async fn test_guid_index_reflects_content_keys() {
    let harness = Harness::new();
    let service = harness.portals();
    service
        .ingest(vec![
            Observation::new("A", 1, 1).with_guid("a.16"),
            Observation::new("B", 2, 2),
        ])
        .await
        .unwrap();

    let index = harness.store.guid_index().await.unwrap();
    assert_eq!(index.len(), 1);
    let record = harness.store.get_by_guid("a.16").await.unwrap().unwrap();
    assert_eq!(index.get("a.16"), Some(&record.content_key));

    let publication = harness.tokens().current("portal-index").await.unwrap();
    assert_eq!(publication.document.keys, index);
    assert_eq!(publication.token.item_count, 2);
}
