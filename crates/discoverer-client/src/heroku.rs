//! Heroku platform API client controlling the worker dyno.
//!
//! The task worker runs as a one-off detached dyno. [`HerokuClient`] starts
//! it when work is enqueued and stops it when the idle controller decides
//! the pool has been idle long enough.
//!
//! API reference: <https://devcenter.heroku.com/articles/platform-api-reference#dyno>

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use discoverer_core::HttpConfig;
use discoverer_core::error::AppError;
use discoverer_core::traits::ProcessControl;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default command used to start the worker dyno.
pub const DEFAULT_WORKER_COMMAND: &str = "discoverer worker";

const API_BASE_URL: &str = "https://api.heroku.com/";
const API_ACCEPT: &str = "application/vnd.heroku+json; version=3";

/// A dyno as reported by the platform API.
///
/// # Examples
///
/// ```
/// use discoverer_client::Dyno;
///
/// let json = r#"{
///     "id": "01234567-89ab-cdef-0123-456789abcdef",
///     "name": "run.1234",
///     "command": "discoverer worker",
///     "state": "up",
///     "type": "run"
/// }"#;
///
/// let dyno: Dyno = serde_json::from_str(json).unwrap();
/// assert_eq!(dyno.name, "run.1234");
/// assert!(dyno.runs("discoverer worker"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Dyno {
    pub id: String,
    pub name: String,
    pub command: String,
    pub state: String,
    #[serde(rename = "type")]
    pub dyno_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Dyno {
    /// True if this dyno was started with `command` (or a longer variant of it).
    pub fn runs(&self, command: &str) -> bool {
        self.command.starts_with(command)
    }

    /// Dynos that are crashed or already stopping do not count as running.
    pub fn is_running(&self) -> bool {
        matches!(self.state.as_str(), "up" | "starting" | "idle")
    }
}

#[derive(Serialize)]
struct CreateDynoRequest<'a> {
    command: &'a str,
    attach: bool,
    #[serde(rename = "type")]
    dyno_type: &'a str,
}

/// HTTP client for the Heroku platform API.
///
/// The id of the worker dyno is remembered after it is started or found, so
/// repeated calls do not have to list every dyno of the app.
///
/// # Examples
///
/// ```no_run
/// use discoverer_client::HerokuClient;
/// use discoverer_core::traits::ProcessControl;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HerokuClient::new("api-key", "discoverer-app")?;
/// client.ensure_running().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HerokuClient {
    client: Client,
    base_url: Url,
    app_name: String,
    worker_command: String,
    cached_dyno: Arc<Mutex<Option<String>>>,
}

impl HerokuClient {
    /// Creates a client for `app_name` authenticated with `api_key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the key or app name is empty.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(api_key: &str, app_name: &str) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError("HEROKU_API_KEY is empty".to_string()));
        }
        if app_name.trim().is_empty() {
            return Err(AppError::ConfigError(
                "HEROKU_APP_NAME is empty".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(API_ACCEPT));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| AppError::ConfigError("HEROKU_API_KEY is not a valid header value".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http_config = HttpConfig::default();
        let client = Client::builder()
            .user_agent(concat!("Discoverer/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(http_config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        let base_url =
            Url::parse(API_BASE_URL).map_err(|e| AppError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            app_name: app_name.trim().to_string(),
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            cached_dyno: Arc::new(Mutex::new(None)),
        })
    }

    /// Overrides the command the worker dyno is started with.
    pub fn with_worker_command(mut self, command: impl Into<String>) -> Self {
        self.worker_command = command.into();
        self
    }

    /// Points the client at another API host.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, AppError> {
        self.base_url = Url::parse(base_url).map_err(|e| AppError::ConfigError(e.to_string()))?;
        Ok(self)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn worker_command(&self) -> &str {
        &self.worker_command
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(&format!("apps/{}/{}", self.app_name, path))
            .map_err(|e| AppError::Generic(e.to_string()))
    }

    fn cached(&self) -> Option<String> {
        self.cached_dyno
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, dyno_id: Option<String>) {
        *self
            .cached_dyno
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = dyno_id;
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, AppError> {
        let mut request = self.client.request(method, url.clone());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(HttpConfig::default().timeout.as_secs())
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AppError::ClientError(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(resp);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimitExceeded);
        }
        if status.is_server_error() {
            return Err(AppError::NetworkError(format!(
                "Server error: HTTP {}",
                status.as_u16()
            )));
        }
        Err(AppError::ClientError(format!(
            "HTTP {} from {}",
            status.as_u16(),
            url
        )))
    }

    /// Lists every dyno of the app.
    pub async fn list_dynos(&self) -> Result<Vec<Dyno>, AppError> {
        let resp = self.send(Method::GET, self.endpoint("dynos")?, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ConfigError(format!(
                "Heroku app not found: {}",
                self.app_name
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::ClientError(e.to_string()))
    }

    async fn get_dyno(&self, dyno_id: &str) -> Result<Option<Dyno>, AppError> {
        let url = self.endpoint(&format!("dynos/{}", dyno_id))?;
        let resp = self.send(Method::GET, url, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let dyno = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        Ok(Some(dyno))
    }

    /// Finds the running worker dyno, trying the remembered id first.
    pub async fn active_worker(&self) -> Result<Option<Dyno>, AppError> {
        if let Some(dyno_id) = self.cached() {
            match self.get_dyno(&dyno_id).await? {
                Some(dyno) if dyno.is_running() => return Ok(Some(dyno)),
                _ => {
                    debug!(dyno_id, "Remembered worker dyno is gone");
                    self.remember(None);
                }
            }
        }

        let worker = find_worker(self.list_dynos().await?, &self.worker_command);
        if let Some(dyno) = &worker {
            self.remember(Some(dyno.id.clone()));
        }
        Ok(worker)
    }

    /// Starts a detached worker dyno.
    pub async fn start_worker(&self) -> Result<Dyno, AppError> {
        let body = serde_json::to_value(CreateDynoRequest {
            command: &self.worker_command,
            attach: false,
            dyno_type: "run",
        })?;
        let resp = self
            .send(Method::POST, self.endpoint("dynos")?, Some(body))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AppError::ConfigError(format!(
                "Heroku app not found: {}",
                self.app_name
            )));
        }
        let dyno: Dyno = resp
            .json()
            .await
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        info!(dyno = %dyno.name, command = %dyno.command, "Started worker dyno");
        self.remember(Some(dyno.id.clone()));
        Ok(dyno)
    }

    /// Stops a dyno. A dyno that no longer exists counts as stopped.
    pub async fn stop_dyno(&self, dyno_id: &str) -> Result<(), AppError> {
        let url = self.endpoint(&format!("dynos/{}/actions/stop", dyno_id))?;
        let resp = self.send(Method::POST, url, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(dyno_id, "Worker dyno already gone");
        } else {
            info!(dyno_id, "Stopped worker dyno");
        }
        Ok(())
    }
}

/// Picks the first running dyno started with `command`.
fn find_worker(dynos: Vec<Dyno>, command: &str) -> Option<Dyno> {
    dynos
        .into_iter()
        .find(|d| d.runs(command) && d.is_running())
}

impl ProcessControl for HerokuClient {
    async fn ensure_running(&self) -> Result<(), AppError> {
        if let Some(dyno) = self.active_worker().await? {
            debug!(dyno = %dyno.name, "Worker dyno already running");
            return Ok(());
        }
        self.start_worker().await.map(|_| ())
    }

    async fn stop(&self) -> Result<(), AppError> {
        match self.active_worker().await? {
            Some(dyno) => {
                self.stop_dyno(&dyno.id).await?;
                self.remember(None);
                Ok(())
            }
            None => {
                debug!("No worker dyno to stop");
                Ok(())
            }
        }
    }
}
