//! Integration tests for the dataset cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use discoverer_core::traits::{ArtifactSink, DistributedLock};
use discoverer_core::{
    AppError, ArtifactState, ArtifactStatus, DatasetFormat, DatasetRequest, ExportConfig,
    Observation,
};
use futures::future::join_all;

use super::common::{
    Harness, INDEX, counting_builder, failing_builder, panicking_builder,
};

fn kml_request() -> DatasetRequest {
    DatasetRequest::new(INDEX, DatasetFormat::Kml)
}

#[tokio::test]
async fn test_hit_after_build() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let built = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(built.status, ArtifactStatus::Ready);

    let hit = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(hit, built);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_dirty(&kml_request()).await.unwrap());
}

#[tokio::test]
async fn test_token_change_forces_rebuild() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();

    harness
        .portals()
        .ingest(vec![Observation::new("New", 1, 1)])
        .await
        .unwrap();

    let lookup = cache.lookup(&kml_request()).await.unwrap();
    assert_eq!(lookup.state, ArtifactState::Stale);
    assert!(cache.is_dirty(&kml_request()).await.unwrap());

    let second = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_ne!(first.source_token, second.source_token);
    assert_eq!(second.source_token, lookup.token.token);

    let payload_ref = second.payload_ref.unwrap();
    let payload = harness.sink.open(&payload_ref).await.unwrap();
    assert_eq!(payload, lookup.token.token.into_bytes());
}

#[tokio::test]
async fn test_concurrent_requests_build_once() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let request = kml_request();
    let results = join_all((0..8).map(|_| {
        cache.get_or_build(&request, counting_builder(calls.clone(), Duration::from_millis(50)))
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.is_ok()));
    let ready = results
        .iter()
        .filter(|r| matches!(r, Ok(a) if a.status == ArtifactStatus::Ready))
        .count();
    assert!(ready >= 1);
    assert!(harness.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_building_row_is_returned_without_building() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let request = kml_request();

    // Someone else holds the build lock and has not written a row yet.
    let address = request.address().unwrap();
    harness.locks.acquire(&address.lock_key()).await.unwrap().unwrap();

    let pending = cache
        .get_or_build(&request, counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(pending.status, ArtifactStatus::Building);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_first_build_deletes_row_and_releases_lock() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = cache
        .get_or_build(&kml_request(), failing_builder(calls.clone()))
        .await;

    assert!(matches!(result, Err(AppError::ArtifactUnavailable(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache.lookup(&kml_request()).await.unwrap().state,
        ArtifactState::Missing
    );
    assert!(harness.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_rebuild_restores_previous_ready() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    harness.tokens().publish(INDEX).await.unwrap();

    let result = cache
        .get_or_build(&kml_request(), failing_builder(calls.clone()))
        .await;
    assert!(matches!(result, Err(AppError::ArtifactUnavailable(_))));

    let lookup = cache.lookup(&kml_request()).await.unwrap();
    assert_eq!(lookup.state, ArtifactState::Stale);
    assert_eq!(lookup.artifact.unwrap().payload_ref, first.payload_ref);
    assert!(harness.locks.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_panicking_builder_is_contained() {
    let harness = Harness::new();
    let cache = harness.cache();

    let result = cache
        .get_or_build(&kml_request(), panicking_builder())
        .await;
    assert!(matches!(result, Err(AppError::ArtifactUnavailable(_))));
    assert!(harness.locks.list().await.unwrap().is_empty());

    // The address is buildable again afterwards.
    let calls = Arc::new(AtomicUsize::new(0));
    let built = cache
        .get_or_build(&kml_request(), counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(built.status, ArtifactStatus::Ready);
}

#[tokio::test]
async fn test_config_selects_distinct_artifacts() {
    let harness = Harness::new();
    let cache = harness.cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let plain = DatasetRequest::new(INDEX, DatasetFormat::Csv);
    let filtered = DatasetRequest::new(INDEX, DatasetFormat::Csv)
        .with_config(ExportConfig::default().with_region("NA"));

    let a = cache
        .get_or_build(&plain, counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    let b = cache
        .get_or_build(&filtered, counting_builder(calls.clone(), Duration::ZERO))
        .await
        .unwrap();

    assert_ne!(a.config_hash, b.config_hash);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_get_or_export_renders_csv() {
    let harness = Harness::new();
    harness
        .portals()
        .ingest(vec![
            Observation::new("Fountain", 45_000_000, -120_000_000)
                .with_guid("f.16")
                .with_region("NA"),
            Observation::new("Statue", 46_000_000, -121_000_000).with_region("EU"),
        ])
        .await
        .unwrap();

    let request = DatasetRequest::new(INDEX, DatasetFormat::Csv)
        .with_config(ExportConfig::default().with_region("NA"));
    let artifact = harness.cache().get_or_export(&request).await.unwrap();

    let payload = harness
        .sink
        .open(artifact.payload_ref.as_deref().unwrap())
        .await
        .unwrap();
    let csv = String::from_utf8(payload).unwrap();
    let lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "guid,name,longitude,latitude,score_region,discovery date");
    assert!(lines[1].starts_with("f.16,Fountain,-120.000000,45.000000,NA,"));
}

#[tokio::test]
async fn test_other_source_names_are_refused() {
    let harness = Harness::new();
    let cache = harness.cache();
    let request = DatasetRequest::new("foo", DatasetFormat::Csv);

    assert!(matches!(
        cache.lookup(&request).await,
        Err(AppError::UnknownSource(name)) if name == "foo"
    ));
    assert!(matches!(
        cache.get_or_export(&request).await,
        Err(AppError::UnknownSource(_))
    ));
    // Nothing was published under the foreign name.
    assert!(harness.tokens().peek("foo").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ingest_makes_csv_export_stale() {
    let harness = Harness::new();
    let cache = harness.cache();
    let request = DatasetRequest::new(INDEX, DatasetFormat::Csv);

    let first = cache.get_or_export(&request).await.unwrap();
    harness
        .portals()
        .ingest(vec![Observation::new("Fountain", 45_000_000, -120_000_000)])
        .await
        .unwrap();
    assert_eq!(
        cache.lookup(&request).await.unwrap().state,
        ArtifactState::Stale
    );

    let second = cache.get_or_export(&request).await.unwrap();
    assert_ne!(second.source_token, first.source_token);
    let payload = harness
        .sink
        .open(second.payload_ref.as_deref().unwrap())
        .await
        .unwrap();
    assert!(String::from_utf8(payload).unwrap().contains("Fountain"));
}
