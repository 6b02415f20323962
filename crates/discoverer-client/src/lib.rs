//! Discoverer Client - HTTP clients for external platform APIs
//!
//! - [`heroku`] - Heroku platform API, used to start and stop the elastic
//!   task worker
//! - [`control`] - [`WorkerControl`], the controller picked at startup
//!
//! The clients handle authentication, request building, response parsing,
//! and error handling for their respective APIs.

pub mod control;
pub mod heroku;

pub use control::WorkerControl;
pub use heroku::{Dyno, HerokuClient};
