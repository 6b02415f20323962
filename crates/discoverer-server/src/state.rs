use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use discoverer_client::WorkerControl;
use discoverer_core::config::WorkerSettings;
use discoverer_core::{
    DatasetCache, DiscovererConfig, LocalArtifactSink, PortalService, QueueWorkerPool,
    VersionTokenCache, WorkerIdleController,
};
use discoverer_db::{
    ActivityRepository, ArtifactRepository, LockRepository, PortalRepository,
    PublicationRepository, TaskRepository,
};

/// Dataset cache wired to the PostgreSQL repositories and a local artifact directory.
pub type PgDatasetCache = DatasetCache<
    PortalRepository,
    PublicationRepository,
    ArtifactRepository,
    LockRepository,
    LocalArtifactSink,
>;

/// Idle controller wired to the PostgreSQL repositories.
pub type PgIdleController = WorkerIdleController<
    LockRepository,
    ActivityRepository,
    QueueWorkerPool<TaskRepository, WorkerControl>,
    TaskRepository,
>;

/// Shared application state for all handlers.
///
/// Every field is cheap to clone; the repositories share one `PgPool`.
#[derive(Clone)]
pub struct AppState {
    /// Validates, merges and republishes observation batches
    pub portal_service: PortalService<PortalRepository, PublicationRepository>,

    /// Content-addressed dataset artifacts
    pub dataset_cache: PgDatasetCache,

    pub artifact_repo: ArtifactRepository,

    /// Task queue for dataset builds and idle checks
    pub task_repo: TaskRepository,

    pub activity_repo: ActivityRepository,

    /// Starts the worker when a build is enqueued
    pub worker_control: WorkerControl,

    pub worker_settings: WorkerSettings,

    /// Name of the published portal index
    pub index_name: String,

    pub pool: PgPool,

    /// Cancellation token for graceful shutdown
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// Creates a new application state with all services initialized.
    pub fn new(
        pool: PgPool,
        config: &DiscovererConfig,
        worker_control: WorkerControl,
        shutdown_token: CancellationToken,
    ) -> Self {
        let portal_repo = PortalRepository::new(pool.clone());
        let publication_repo = PublicationRepository::new(pool.clone());
        let artifact_repo = ArtifactRepository::new(pool.clone());

        let tokens = VersionTokenCache::new(portal_repo.clone(), publication_repo)
            .with_search_region(config.index.search_region.clone());
        let dataset_cache = DatasetCache::new(
            tokens.clone(),
            artifact_repo.clone(),
            LockRepository::new(pool.clone()),
            LocalArtifactSink::new(config.export.artifact_dir.clone()),
        )
        .with_index_name(config.index.name.clone());

        Self {
            portal_service: PortalService::new(portal_repo, tokens, &config.index.name),
            dataset_cache,
            artifact_repo,
            task_repo: TaskRepository::new(pool.clone()),
            activity_repo: ActivityRepository::new(pool.clone()),
            worker_control,
            worker_settings: config.worker.clone(),
            index_name: config.index.name.clone(),
            pool,
            shutdown_token,
        }
    }

    /// Builds the idle controller that stops the worker through `worker_control`.
    pub fn idle_controller(&self) -> PgIdleController {
        WorkerIdleController::new(
            LockRepository::new(self.pool.clone()),
            self.activity_repo.clone(),
            QueueWorkerPool::new(self.task_repo.clone(), self.worker_control.clone()),
            self.task_repo.clone(),
            self.worker_settings.idle_config(),
        )
    }
}
