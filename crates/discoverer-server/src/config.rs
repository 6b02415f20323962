use clap::Parser;
use std::path::PathBuf;

/// Server configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug, Clone)]
#[command(name = "discoverer-server")]
#[command(author, version, about = "REST API server for Discoverer")]
pub struct ServerConfig {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Path to discoverer.toml configuration file
    #[arg(long, env = "DISCOVERER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Allowed CORS origins, comma separated, or "*"
    #[arg(long, env = "CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Run a task worker inside the server process
    #[arg(long, env = "DISCOVERER_EMBEDDED_WORKER")]
    pub embedded_worker: bool,

    /// Heroku API key used to start and stop the worker dyno
    #[arg(long, env = "HEROKU_API_KEY", hide_env_values = true)]
    pub heroku_api_key: Option<String>,

    /// Heroku app that owns the worker dyno
    #[arg(long, env = "HEROKU_APP_NAME")]
    pub heroku_app_name: Option<String>,
}
