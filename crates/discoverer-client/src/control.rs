//! Runtime selection of the worker process controller.
//!
//! [`ProcessControl`] returns `impl Future`, so it is not object-safe. The
//! binaries pick a controller from their configuration and hold it as a
//! [`WorkerControl`] instead of a `dyn` trait object.

use discoverer_core::LocalProcessControl;
use discoverer_core::error::AppError;
use discoverer_core::traits::ProcessControl;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::HerokuClient;

/// Worker process controller chosen at startup.
#[derive(Clone)]
pub enum WorkerControl {
    /// A detached worker dyno on Heroku.
    Heroku(HerokuClient),
    /// A worker loop inside the current process.
    Local(LocalProcessControl),
    /// Workers are managed outside of Discoverer. Nothing is started or stopped.
    External,
}

impl WorkerControl {
    /// Uses Heroku when both credentials are present, `fallback` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if only one of the two is set.
    pub fn from_heroku_env(
        api_key: Option<&str>,
        app_name: Option<&str>,
        fallback: WorkerControl,
    ) -> Result<Self, AppError> {
        match (api_key, app_name) {
            (Some(key), Some(app)) => Ok(Self::Heroku(HerokuClient::new(key, app)?)),
            (None, None) => Ok(fallback),
            _ => Err(AppError::ConfigError(
                "HEROKU_API_KEY and HEROKU_APP_NAME must be set together".to_string(),
            )),
        }
    }

    pub fn local(token: CancellationToken) -> Self {
        Self::Local(LocalProcessControl::new(token))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Heroku(_) => "heroku",
            Self::Local(_) => "local",
            Self::External => "external",
        }
    }
}

impl ProcessControl for WorkerControl {
    async fn ensure_running(&self) -> Result<(), AppError> {
        match self {
            Self::Heroku(c) => c.ensure_running().await,
            Self::Local(c) => c.ensure_running().await,
            Self::External => Ok(()),
        }
    }

    async fn stop(&self) -> Result<(), AppError> {
        match self {
            Self::Heroku(c) => c.stop().await,
            Self::Local(c) => c.stop().await,
            Self::External => {
                debug!("Worker stop requested but workers are managed externally");
                Ok(())
            }
        }
    }
}
