//! HTTP request handlers for API endpoints.

pub mod datasets;
pub mod health;
pub mod index;
pub mod portals;
pub mod tasks;
