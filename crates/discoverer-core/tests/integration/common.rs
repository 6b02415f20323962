//! Test utilities and fakes for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use discoverer_core::dataset::BuildContext;
use discoverer_core::memory::{
    MemoryActivityStore, MemoryArtifactSink, MemoryArtifactStore, MemoryLockStore,
    MemoryPortalStore, MemoryPublicationStore, MemoryTaskQueue,
};
use discoverer_core::task::TaskCounts;
use discoverer_core::traits::WorkerPool;
use discoverer_core::{
    AppError, DatasetCache, IdleConfig, PortalService, VersionTokenCache, WorkerIdleController,
};
use futures::FutureExt;
use futures::future::BoxFuture;

pub const INDEX: &str = "portal-index";

pub type MemoryCache = DatasetCache<
    MemoryPortalStore,
    MemoryPublicationStore,
    MemoryArtifactStore,
    MemoryLockStore,
    MemoryArtifactSink,
>;

pub type MemoryController =
    WorkerIdleController<MemoryLockStore, MemoryActivityStore, RecordingPool, MemoryTaskQueue>;

/// Every in-memory store wired together.
#[derive(Clone)]
pub struct Harness {
    pub store: MemoryPortalStore,
    pub publications: MemoryPublicationStore,
    pub artifacts: MemoryArtifactStore,
    pub locks: MemoryLockStore,
    pub sink: MemoryArtifactSink,
    pub activity: MemoryActivityStore,
    pub queue: MemoryTaskQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemoryPortalStore::new(),
            publications: MemoryPublicationStore::new(),
            artifacts: MemoryArtifactStore::new(),
            locks: MemoryLockStore::new(),
            sink: MemoryArtifactSink::new(),
            activity: MemoryActivityStore::new(),
            queue: MemoryTaskQueue::new(),
        }
    }

    pub fn tokens(&self) -> VersionTokenCache<MemoryPortalStore, MemoryPublicationStore> {
        VersionTokenCache::new(self.store.clone(), self.publications.clone())
    }

    pub fn portals(&self) -> PortalService<MemoryPortalStore, MemoryPublicationStore> {
        PortalService::new(self.store.clone(), self.tokens(), INDEX)
    }

    pub fn cache(&self) -> MemoryCache {
        DatasetCache::new(
            self.tokens(),
            self.artifacts.clone(),
            self.locks.clone(),
            self.sink.clone(),
        )
        .with_index_name(INDEX)
    }

    pub fn controller(&self, pool: RecordingPool) -> MemoryController {
        WorkerIdleController::new(
            self.locks.clone(),
            self.activity.clone(),
            pool,
            self.queue.clone(),
            IdleConfig::default(),
        )
    }
}

// =============================================================================
// Builders
// =============================================================================

pub type BuildFuture = BoxFuture<'static, Result<Vec<u8>, AppError>>;
pub type Builder = Box<dyn FnOnce(BuildContext) -> BuildFuture + Send>;

/// Builder that counts its invocations and returns the token it built from.
pub fn counting_builder(calls: Arc<AtomicUsize>, delay: Duration) -> Builder {
    Box::new(move |ctx: BuildContext| -> BuildFuture {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(ctx.token.token.into_bytes())
        }
        .boxed()
    })
}

/// Builder that always fails with a non-retryable error.
pub fn failing_builder(calls: Arc<AtomicUsize>) -> Builder {
    Box::new(move |_ctx: BuildContext| -> BuildFuture {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Generic("encoder exploded".to_string()))
        }
        .boxed()
    })
}

fn explode() -> Result<Vec<u8>, AppError> {
    panic!("builder panicked")
}

/// Builder that panics while building.
pub fn panicking_builder() -> Builder {
    Box::new(move |_ctx: BuildContext| -> BuildFuture {
        async move {
            tokio::task::yield_now().await;
            explode()
        }
        .boxed()
    })
}

// =============================================================================
// RecordingPool
// =============================================================================

/// Worker pool with scripted task counts that records shutdowns.
#[derive(Clone, Default)]
pub struct RecordingPool {
    counts: Arc<Mutex<TaskCounts>>,
    shutdowns: Arc<AtomicUsize>,
}

impl RecordingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_counts(&self, counts: TaskCounts) {
        *self.counts.lock().unwrap() = counts;
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl WorkerPool for RecordingPool {
    async fn task_counts(&self) -> Result<TaskCounts, AppError> {
        Ok(*self.counts.lock().unwrap())
    }

    async fn shutdown(&self) -> Result<(), AppError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
