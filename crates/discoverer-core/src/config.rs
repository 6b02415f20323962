//! Configuration types for Discoverer components.
//!
//! Runtime settings live in `discoverer.toml`; connection strings and API
//! keys come from the environment through the binaries' clap configs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;

use crate::error::AppError;
use crate::geo::Polygon;
use crate::task::{RetryConfig, WorkerConfig};

/// Lock key guarding the single scheduled idle check.
pub const IDLE_LOCK_KEY: &str = "idle-lock";

/// Default name of the published portal index.
pub const DEFAULT_INDEX_NAME: &str = "portal-index";

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for external API calls.
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Settings for the worker idle-timeout controller.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// How long the worker may go without accepting a task before it is stopped.
    pub idle_period: TimeDelta,
    /// Lock key used to keep at most one idle check scheduled.
    pub lock_key: String,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_period: TimeDelta::minutes(5),
            lock_key: IDLE_LOCK_KEY.to_string(),
        }
    }
}

impl IdleConfig {
    pub fn with_idle_period(mut self, period: TimeDelta) -> Self {
        self.idle_period = period;
        self
    }
}

// =============================================================================
// discoverer.toml
// =============================================================================

/// Root configuration structure for `discoverer.toml`.
///
/// # Example
///
/// ```toml
/// [index]
/// name = "portal-index"
/// search_region = [[-122.5, 37.7], [-122.3, 37.7], [-122.3, 37.9]]
///
/// [worker]
/// idle_period_minutes = 5
///
/// [export]
/// artifact_dir = "/var/lib/discoverer/artifacts"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscovererConfig {
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

/// `[index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Name under which the portal index snapshot is published.
    #[serde(default = "default_index_name")]
    pub name: String,
    /// Polygon clients should restrict their scanning to, as `[lng, lat]` pairs.
    pub search_region: Option<Polygon>,
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            name: default_index_name(),
            search_region: None,
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_idle_period_minutes")]
    pub idle_period_minutes: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_idle_period_minutes() -> u32 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_period_minutes: default_idle_period_minutes(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl WorkerSettings {
    pub fn idle_config(&self) -> IdleConfig {
        IdleConfig::default().with_idle_period(TimeDelta::minutes(self.idle_period_minutes.into()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Worker loop settings with a fresh worker id.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.poll_interval())
            .with_retry_config(RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            })
    }
}

/// `[export]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Directory where built dataset payloads are written.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_artifact_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("discoverer").join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
        }
    }
}

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "discoverer.toml";

/// Returns the default configuration directory path (`~/.config/discoverer/`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("discoverer"))
}

/// Returns the default configuration file path.
pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Discoverer configuration

[index]
# Name the portal index snapshot is published under.
name = "portal-index"
# Optional polygon (as [lng, lat] pairs) sent to clients as the active search region.
# search_region = [[-122.52, 37.70], [-122.35, 37.70], [-122.35, 37.83], [-122.52, 37.83]]

[worker]
# Minutes without task activity before the worker process is stopped.
idle_period_minutes = 5
poll_interval_secs = 5
max_retries = 3

[export]
# artifact_dir = "/var/lib/discoverer/artifacts"
"#;

/// Load configuration from a TOML file.
///
/// With no explicit path the default location is used; a commented template
/// is written there on first use and defaults are returned if that fails.
/// An explicit path that does not exist is an error.
pub fn load_config(path: Option<PathBuf>) -> Result<DiscovererConfig, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path {
        Some(p) => p,
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(DiscovererConfig::default()),
        },
    };

    if !config_path.exists() {
        if using_default_path {
            if let Err(e) = create_default_config(&config_path) {
                tracing::warn!("Could not create default config template: {}", e);
                return Ok(DiscovererConfig::default());
            }
        } else {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!("Created default config template at: {}", path.display());

    Ok(())
}
