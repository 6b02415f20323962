//! Discoverer Server - REST API for portal ingestion and dataset downloads
//!
//! This crate provides an HTTP API over Discoverer's core services:
//!
//! - **Portals**: Submit observation batches and look up merged records
//! - **Index**: Read the published guid index with conditional requests
//! - **Datasets**: Request KML/CSV artifacts and download them once built
//! - **Tasks**: Follow queued build tasks and the worker's idle state
//!
//! # API Documentation
//!
//! When running the server, interactive API documentation is available
//! at `/swagger-ui`.

pub mod config;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod openapi;
pub mod router;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use router::create_router;
pub use state::AppState;
