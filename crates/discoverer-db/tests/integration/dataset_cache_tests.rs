//! The dataset cache running on the PostgreSQL repositories.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use discoverer_core::dataset::BuildContext;
use discoverer_core::memory::MemoryArtifactSink;
use discoverer_core::traits::{ArtifactSink, DistributedLock, PortalStore};
use discoverer_core::{
    AppError, ArtifactStatus, DatasetCache, DatasetFormat, DatasetRequest, Observation,
    VersionTokenCache,
};
use discoverer_db::{ArtifactRepository, LockRepository, PortalRepository, PublicationRepository};
use futures::future::join_all;
use sqlx::PgPool;

use crate::integration::common::setup_test_db;

type PgCache = DatasetCache<
    PortalRepository,
    PublicationRepository,
    ArtifactRepository,
    LockRepository,
    MemoryArtifactSink,
>;

fn cache(pool: &PgPool, sink: MemoryArtifactSink) -> PgCache {
    DatasetCache::new(
        VersionTokenCache::new(
            PortalRepository::new(pool.clone()),
            PublicationRepository::new(pool.clone()),
        ),
        ArtifactRepository::new(pool.clone()),
        LockRepository::new(pool.clone()),
        sink,
    )
}

#[tokio::test]
async fn test_concurrent_requests_build_once() {
    let (pool, _container) = setup_test_db().await;
    let cache = cache(&pool, MemoryArtifactSink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let request = DatasetRequest::new("portal-index", DatasetFormat::Kml);
    // Publish up front so every caller sees the same token.
    cache.tokens().publish("portal-index").await.unwrap();

    let results = join_all((0..8).map(|_| {
        let calls = calls.clone();
        cache.get_or_build(&request, move |ctx: BuildContext| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, AppError>(ctx.token.token.into_bytes())
        })
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(LockRepository::new(pool).list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_export_rebuilds_after_publish() {
    let (pool, _container) = setup_test_db().await;
    let sink = MemoryArtifactSink::new();
    let cache = cache(&pool, sink.clone());
    let portals = PortalRepository::new(pool.clone());
    let request = DatasetRequest::new("portal-index", DatasetFormat::Csv);

    portals
        .merge_batch(&[Observation::new("Fountain", 45_000_000, -120_000_000).with_guid("f.16")])
        .await
        .unwrap();
    let first = cache.get_or_export(&request).await.unwrap();
    assert_eq!(first.status, ArtifactStatus::Ready);

    portals
        .merge_batch(&[Observation::new("Statue", 46_000_000, -121_000_000)])
        .await
        .unwrap();
    cache.tokens().publish("portal-index").await.unwrap();
    assert!(cache.is_dirty(&request).await.unwrap());

    let second = cache.get_or_export(&request).await.unwrap();
    assert_ne!(second.source_token, first.source_token);

    let payload = sink.open(second.payload_ref.as_deref().unwrap()).await.unwrap();
    let csv = String::from_utf8(payload).unwrap();
    assert!(csv.contains("Fountain"));
    assert!(csv.contains("Statue"));
}

#[tokio::test]
async fn test_failed_build_leaves_no_row() {
    let (pool, _container) = setup_test_db().await;
    let cache = cache(&pool, MemoryArtifactSink::new());
    let request = DatasetRequest::new("portal-index", DatasetFormat::Kml);

    let result = cache
        .get_or_build(&request, |_ctx: BuildContext| async {
            Err::<Vec<u8>, _>(AppError::Generic("encoder failed".to_string()))
        })
        .await;

    assert!(matches!(result, Err(AppError::ArtifactUnavailable(_))));
    assert!(cache.lookup(&request).await.unwrap().artifact.is_none());
    assert!(LockRepository::new(pool).list().await.unwrap().is_empty());
}
