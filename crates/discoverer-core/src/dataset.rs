//! Content-addressed dataset artifacts.
//!
//! A dataset is addressed by `(name, format, config_hash)`; the row at that
//! address remembers which version token it was built from. A `Ready` row
//! whose token differs from the live one is stale and gets rebuilt on the
//! next request. Builds are guarded by a [`DistributedLock`] so at most one
//! caller builds a given address at a time, and nobody ever waits for it.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_INDEX_NAME;
use crate::error::AppError;
use crate::export::{DatasetFormat, ExportConfig, ExportService};
use crate::lock::{LockHolder, dataset_build_key};
use crate::publication::{VersionToken, VersionTokenCache};
use crate::traits::{ArtifactSink, ArtifactStore, DistributedLock, PortalStore, PublicationStore};

// =============================================================================
// Addresses and rows
// =============================================================================

/// A client request for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRequest {
    /// Name of the published resource the dataset derives from.
    pub name: String,
    pub format: DatasetFormat,
    #[serde(default)]
    pub config: ExportConfig,
}

impl DatasetRequest {
    pub fn new(name: impl Into<String>, format: DatasetFormat) -> Self {
        Self {
            name: name.into(),
            format,
            config: ExportConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(&self) -> Result<DatasetAddress, AppError> {
        Ok(DatasetAddress {
            name: self.name.clone(),
            format: self.format,
            config_hash: self.config.config_hash()?,
        })
    }
}

/// Storage address of a dataset artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetAddress {
    pub name: String,
    pub format: DatasetFormat,
    pub config_hash: String,
}

impl DatasetAddress {
    /// Key of the lock guarding builds of this address.
    pub fn lock_key(&self) -> String {
        dataset_build_key(&self.name, self.format.as_str(), &self.config_hash)
    }
}

impl std::fmt::Display for DatasetAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}@{}", self.name, self.format, self.config_hash)
    }
}

/// Persisted status of an artifact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Building,
    Ready,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Building => "building",
            ArtifactStatus::Ready => "ready",
        }
    }
}

/// Error type for parsing ArtifactStatus from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseArtifactStatusError(String);

impl std::fmt::Display for ParseArtifactStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid artifact status: {}", self.0)
    }
}

impl std::error::Error for ParseArtifactStatusError {}

impl std::str::FromStr for ArtifactStatus {
    type Err = ParseArtifactStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(ArtifactStatus::Building),
            "ready" => Ok(ArtifactStatus::Ready),
            _ => Err(ParseArtifactStatusError(s.to_string())),
        }
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-time view of an address against the live token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    Missing,
    Building,
    Ready,
    /// `Ready`, but built from an older token.
    Stale,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Missing => "missing",
            ArtifactState::Building => "building",
            ArtifactState::Ready => "ready",
            ArtifactState::Stale => "stale",
        }
    }
}

/// A dataset artifact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetArtifact {
    pub name: String,
    pub format: DatasetFormat,
    pub config_hash: String,
    /// Version token the payload was (or is being) built from.
    pub source_token: String,
    pub status: ArtifactStatus,
    /// Sink reference of the payload; set once `Ready`.
    pub payload_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetArtifact {
    /// An in-progress view for an address whose builder has not written its row yet.
    pub fn pending(address: &DatasetAddress, source_token: &str) -> Self {
        let now = Utc::now();
        Self {
            name: address.name.clone(),
            format: address.format,
            config_hash: address.config_hash.clone(),
            source_token: source_token.to_string(),
            status: ArtifactStatus::Building,
            payload_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn address(&self) -> DatasetAddress {
        DatasetAddress {
            name: self.name.clone(),
            format: self.format,
            config_hash: self.config_hash.clone(),
        }
    }

    pub fn state(&self, live_token: &str) -> ArtifactState {
        match self.status {
            ArtifactStatus::Building => ArtifactState::Building,
            ArtifactStatus::Ready if self.source_token == live_token => ArtifactState::Ready,
            ArtifactStatus::Ready => ArtifactState::Stale,
        }
    }

    pub fn is_ready_for(&self, live_token: &str) -> bool {
        self.state(live_token) == ArtifactState::Ready
    }
}

/// Result of [`DatasetCache::lookup`].
#[derive(Debug, Clone)]
pub struct DatasetLookup {
    pub address: DatasetAddress,
    pub token: VersionToken,
    pub artifact: Option<DatasetArtifact>,
    pub state: ArtifactState,
}

/// Inputs handed to a dataset builder.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub request: DatasetRequest,
    pub address: DatasetAddress,
    pub token: VersionToken,
}

// =============================================================================
// Dataset cache
// =============================================================================

/// Lazily builds dataset artifacts, at most once per address and token.
pub struct DatasetCache<P, S, A, L, K>
where
    P: PortalStore,
    S: PublicationStore,
    A: ArtifactStore,
    L: DistributedLock,
    K: ArtifactSink,
{
    tokens: VersionTokenCache<P, S>,
    artifacts: A,
    locks: L,
    sink: K,
    index_name: String,
}

impl<P, S, A, L, K> Clone for DatasetCache<P, S, A, L, K>
where
    P: PortalStore + Clone,
    S: PublicationStore + Clone,
    A: ArtifactStore + Clone,
    L: DistributedLock + Clone,
    K: ArtifactSink + Clone,
{
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            artifacts: self.artifacts.clone(),
            locks: self.locks.clone(),
            sink: self.sink.clone(),
            index_name: self.index_name.clone(),
        }
    }
}

impl<P, S, A, L, K> DatasetCache<P, S, A, L, K>
where
    P: PortalStore,
    S: PublicationStore,
    A: ArtifactStore,
    L: DistributedLock,
    K: ArtifactSink,
{
    pub fn new(tokens: VersionTokenCache<P, S>, artifacts: A, locks: L, sink: K) -> Self {
        Self {
            tokens,
            artifacts,
            locks,
            sink,
            index_name: DEFAULT_INDEX_NAME.to_string(),
        }
    }

    /// Sets the published index datasets are built from.
    pub fn with_index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = name.into();
        self
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn tokens(&self) -> &VersionTokenCache<P, S> {
        &self.tokens
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Reports the state of a request's address without building anything.
    ///
    /// Publishes the index first if it has never been published. Requests
    /// naming anything but the index are refused: only the index is
    /// republished on ingest, so nothing else would ever go stale.
    pub async fn lookup(&self, request: &DatasetRequest) -> Result<DatasetLookup, AppError> {
        if request.name != self.index_name {
            return Err(AppError::UnknownSource(request.name.clone()));
        }
        let address = request.address()?;
        let token = self.tokens.get_or_publish(&request.name).await?;
        let artifact = self.artifacts.find(&address).await?;
        let state = match &artifact {
            Some(row) => row.state(&token.token),
            None => ArtifactState::Missing,
        };

        Ok(DatasetLookup {
            address,
            token,
            artifact,
            state,
        })
    }

    /// Returns true unless a `Ready` artifact exists for the live token.
    pub async fn is_dirty(&self, request: &DatasetRequest) -> Result<bool, AppError> {
        let lookup = self.lookup(request).await?;
        Ok(lookup.state != ArtifactState::Ready)
    }

    /// Returns the artifact for `request`, building it if missing or stale.
    ///
    /// A `Building` row is returned as-is. When another caller holds the
    /// build lock the current row (or a synthesized `Building` view) is
    /// returned immediately. A failing or panicking builder rolls the row
    /// back and yields [`AppError::ArtifactUnavailable`].
    pub async fn get_or_build<F, Fut>(
        &self,
        request: &DatasetRequest,
        builder: F,
    ) -> Result<DatasetArtifact, AppError>
    where
        F: FnOnce(BuildContext) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, AppError>> + Send,
    {
        let lookup = self.lookup(request).await?;
        match (&lookup.artifact, lookup.state) {
            (Some(row), ArtifactState::Ready) => {
                debug!(address = %lookup.address, "Dataset cache hit");
                return Ok(row.clone());
            }
            (Some(row), ArtifactState::Building) => {
                debug!(address = %lookup.address, "Dataset build already in progress");
                return Ok(row.clone());
            }
            _ => {}
        }

        let DatasetLookup { address, token, .. } = lookup;
        let lock_key = address.lock_key();
        let Some(holder) = self.locks.acquire(&lock_key).await? else {
            debug!(address = %address, "Build lock held elsewhere");
            return match self.artifacts.find(&address).await? {
                Some(row) => Ok(row),
                None => Ok(DatasetArtifact::pending(&address, &token.token)),
            };
        };

        let result = self
            .build_locked(request, &address, token, builder)
            .await;
        self.release_lock(&lock_key, &holder).await;
        result
    }

    async fn build_locked<F, Fut>(
        &self,
        request: &DatasetRequest,
        address: &DatasetAddress,
        token: VersionToken,
        builder: F,
    ) -> Result<DatasetArtifact, AppError>
    where
        F: FnOnce(BuildContext) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, AppError>> + Send,
    {
        // Another caller may have finished between our read and the acquire.
        if let Some(row) = self.artifacts.find(address).await? {
            if row.is_ready_for(&token.token) {
                return Ok(row);
            }
        }

        self.artifacts.begin_build(address, &token.token).await?;
        info!(address = %address, token = %token.token, "Building dataset");

        let source_token = token.token.clone();
        let context = BuildContext {
            request: request.clone(),
            address: address.clone(),
            token,
        };

        let outcome = AssertUnwindSafe(async move { builder(context).await })
            .catch_unwind()
            .await;

        let payload = match outcome {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                error!(address = %address, error = %e, "Dataset build failed");
                return Err(self.rollback(address).await);
            }
            Err(_) => {
                error!(address = %address, "Dataset builder panicked");
                return Err(self.rollback(address).await);
            }
        };

        let stored = async {
            let payload_ref = self.sink.put(address, &source_token, payload).await?;
            self.artifacts
                .complete_build(address, &source_token, &payload_ref)
                .await
        }
        .await;

        match stored {
            Ok(row) => {
                info!(address = %address, payload_ref = ?row.payload_ref, "Dataset ready");
                Ok(row)
            }
            Err(e) => {
                error!(address = %address, error = %e, "Failed to store dataset payload");
                Err(self.rollback(address).await)
            }
        }
    }

    async fn rollback(&self, address: &DatasetAddress) -> AppError {
        if let Err(e) = self.artifacts.rollback_build(address).await {
            warn!(address = %address, error = %e, "Failed to roll back dataset row");
        }
        AppError::ArtifactUnavailable(address.to_string())
    }

    async fn release_lock(&self, key: &str, holder: &LockHolder) {
        match self.locks.release(key, holder).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "Build lock was no longer held by this builder"),
            Err(e) => warn!(key, error = %e, "Failed to release build lock"),
        }
    }
}

impl<P, S, A, L, K> DatasetCache<P, S, A, L, K>
where
    P: PortalStore + Clone,
    S: PublicationStore,
    A: ArtifactStore,
    L: DistributedLock,
    K: ArtifactSink,
{
    /// [`get_or_build`](Self::get_or_build) with the portal export encoders as builder.
    pub async fn get_or_export(
        &self,
        request: &DatasetRequest,
    ) -> Result<DatasetArtifact, AppError> {
        let exporter = ExportService::new(self.tokens.portals().clone());
        self.get_or_build(request, move |ctx: BuildContext| async move {
            exporter
                .render(ctx.request.format, &ctx.request.config, Utc::now())
                .await
        })
        .await
    }
}
