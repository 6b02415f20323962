//! Discoverer DB - PostgreSQL repositories for the core store traits.
//!
//! Every trait in [`discoverer_core::traits`] that holds shared state has a
//! repository here, so several server and worker processes can share one
//! database.
//!
//! # Overview
//!
//! - [`PortalRepository`] - canonical portal records with JSONB history
//! - [`PublicationRepository`] - latest published index per name
//! - [`LockRepository`] - advisory named locks without expiry
//! - [`ArtifactRepository`] - dataset artifact rows with rollback state
//! - [`ActivityRepository`] - worker heartbeat and lifecycle state
//! - [`TaskRepository`] - persistent task queue
//!
//! Call [`run_migrations`] once at startup to create the tables.

mod activity_repository;
mod artifact_repository;
mod lock_repository;
mod portal_repository;
mod publication_repository;
mod schema;
mod task_repository;

pub use activity_repository::ActivityRepository;
pub use artifact_repository::ArtifactRepository;
pub use lock_repository::LockRepository;
pub use portal_repository::PortalRepository;
pub use publication_repository::PublicationRepository;
pub use schema::{MIGRATIONS, run_migrations};
pub use task_repository::TaskRepository;
