//! Discoverer Core - Domain types, merge logic, caches and worker services.
//!
//! This crate provides the core functionality for Discoverer, including:
//!
//! - **Domain models**: [`Observation`], [`PortalRecord`], [`GeoPoint`]
//! - **Merge logic**: identity resolution and history-preserving merge ([`merge`])
//! - **Caches**: [`VersionTokenCache`] for published snapshots, [`DatasetCache`]
//!   for content-addressed dataset artifacts
//! - **Worker lifecycle**: [`WorkerIdleController`] and the task [`WorkerService`]
//! - **Traits**: [`PortalStore`], [`DistributedLock`], [`TaskQueue`] and friends for
//!   dependency injection
//!
//! # Architecture
//!
//! Every piece of shared state is reached through a trait. PostgreSQL
//! implementations live in `discoverer-db`; [`memory`] holds in-process
//! implementations used by tests and single-node deployments.
//!
//! ```text
//! submissions → PortalStore::merge_batch → VersionTokenCache::publish
//!            → stale DatasetArtifact rows → DatasetCache::get_or_build
//! ```
//!
//! # Example
//!
//! ```ignore
//! use discoverer_core::memory::{MemoryPortalStore, MemoryPublicationStore};
//! use discoverer_core::{Observation, PortalService, VersionTokenCache};
//!
//! let store = MemoryPortalStore::new();
//! let tokens = VersionTokenCache::new(store.clone(), MemoryPublicationStore::new());
//! let service = PortalService::new(store, tokens, "portal-index");
//!
//! let report = service
//!     .ingest(vec![Observation::new("Fountain", 45_000_000, -120_000_000)])
//!     .await?;
//! assert_eq!(report.result.inserted, 1);
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod export;
pub mod geo;
pub mod identity;
pub mod idle;
pub mod ingest;
pub mod lock;
pub mod memory;
pub mod merge;
pub mod models;
pub mod publication;
pub mod storage;
pub mod task;
pub mod traits;
pub mod worker;

// Configuration
pub use config::{
    DbConfig, DiscovererConfig, HttpConfig, IDLE_LOCK_KEY, IdleConfig, default_config_path,
    load_config,
};

// Error handling
pub use error::AppError;

// Domain models
pub use geo::Polygon;
pub use models::{GeoPoint, Observation, PortalIdentity, PortalRecord, PortalVersion};

// Merge logic
pub use identity::compute_content_key;
pub use merge::{MergeOutcome, MergeRejection, MergeResult, RejectionReason};

// Publications and datasets
pub use dataset::{
    ArtifactState, ArtifactStatus, DatasetAddress, DatasetArtifact, DatasetCache, DatasetLookup,
    DatasetRequest,
};
pub use export::{CsvOptions, DatasetFormat, ExportConfig, ExportService};
pub use lock::{LockEntry, LockHolder};
pub use publication::{IndexDocument, Publication, VersionToken, VersionTokenCache};
pub use storage::LocalArtifactSink;

// Ingest
pub use ingest::{
    IngestEvent, IngestReport, IngestReporter, PortalService, SilentIngestReporter,
    TracingIngestReporter,
};

// Traits for dependency injection
pub use traits::{
    ActivityStore, ArtifactSink, ArtifactStore, DistributedLock, PortalStore, ProcessControl,
    PublicationStore, TaskQueue, WorkerPool,
};

// Task queue types
pub use task::{
    CreateTaskRequest, RetryConfig, Task, TaskCounts, TaskKind, TaskStatus, WorkerConfig,
};

// Worker lifecycle and service
pub use idle::{
    ActivityInterceptor, IdleCheckOutcome, QueueWorkerPool, WorkerIdleController, WorkerState,
};
pub use worker::{
    LocalProcessControl, NoopInterceptor, SilentWorkerReporter, TaskHandler, TaskInterceptor,
    TaskRouter, TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerService,
};
