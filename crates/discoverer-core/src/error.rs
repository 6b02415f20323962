use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents all errors that can occur while merging portal
/// observations, publishing snapshots, building datasets or steering the
/// worker pool. It uses `thiserror` for ergonomic conversion from the
/// underlying library errors.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use discoverer_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Generic("Something went wrong".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Wraps connection failures, query errors and constraint violations
    /// reported by SQLx.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// HTTP client request failed.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// An observation failed validation (empty name, coordinates out of range).
    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    /// A dataset was requested from something other than the published index.
    #[error("Unknown dataset source: {0}")]
    UnknownSource(String),

    /// Portal record not found.
    #[error("Portal not found: {0}")]
    PortalNotFound(String),

    /// A dataset build failed and was rolled back. Callers should retry later.
    #[error("Dataset {0} is unavailable, retry later")]
    ArtifactUnavailable(String),

    /// Writing or reading an artifact payload failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Configuration file error.
    ///
    /// Reading or parsing `discoverer.toml` failed, or a required
    /// environment variable is missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Try: docker-compose up -d".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The platform API may be slow or unreachable.".to_string()
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::UnknownSource(name) => format!(
                "Datasets can only be built from the published index, not '{}'.",
                name
            ),
            AppError::ArtifactUnavailable(name) => format!(
                "Dataset {} could not be built.\n   Try again in a few minutes.",
                name
            ),
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The server may be overloaded. Try again later.",
                    secs
                )
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::ConfigError(msg) => {
                format!(
                    "Configuration error: {}\n   Check your configuration file.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use discoverer_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::ArtifactUnavailable("portals".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::InvalidObservation("empty name".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
                | AppError::ArtifactUnavailable(_)
                | AppError::DatabaseError(sqlx::Error::PoolTimedOut)
        )
    }
}
