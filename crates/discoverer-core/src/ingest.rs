//! Ingest service for client portal submissions.
//!
//! [`PortalService`] validates a submitted batch, merges the valid
//! observations through the [`PortalStore`], and republishes the portal
//! index when anything was written. Republishing mints a new version token,
//! which is what marks every dataset built from the old one as stale.

use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::merge::{MergeResult, RejectionReason};
use crate::models::{Observation, PortalRecord};
use crate::publication::{VersionToken, VersionTokenCache};
use crate::traits::{PortalStore, PublicationStore};

// =============================================================================
// Ingest Events
// =============================================================================

/// Events emitted while ingesting a batch.
#[derive(Debug, Clone)]
pub enum IngestEvent<'a> {
    /// A batch arrived.
    BatchReceived { count: usize },
    /// An observation failed validation before reaching the store.
    ObservationInvalid { index: usize, message: &'a str },
    /// The store finished merging the batch.
    BatchMerged { result: &'a MergeResult },
    /// The index was republished after changes.
    IndexPublished { token: &'a VersionToken },
}

/// Trait for reporting ingest events.
pub trait IngestReporter: Send + Sync {
    fn report(&self, event: IngestEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentIngestReporter;

impl IngestReporter for SilentIngestReporter {}

/// Tracing-based reporter for CLI/server logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingIngestReporter;

impl IngestReporter for TracingIngestReporter {
    fn report(&self, event: IngestEvent<'_>) {
        match event {
            IngestEvent::BatchReceived { count } => {
                debug!(count, "Ingest batch received");
            }
            IngestEvent::ObservationInvalid { index, message } => {
                warn!(index, message, "Observation rejected");
            }
            IngestEvent::BatchMerged { result } => {
                info!(
                    inserted = result.inserted,
                    modified = result.modified,
                    unchanged = result.unchanged,
                    rejected = result.rejected.len(),
                    "Batch merged"
                );
            }
            IngestEvent::IndexPublished { token } => {
                info!(name = %token.name, token = %token.token, "Index republished");
            }
        }
    }
}

/// Outcome of one ingest call.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub result: MergeResult,
    /// Set when the batch changed the store and the index was republished.
    pub published: Option<VersionToken>,
}

// =============================================================================
// Portal Service
// =============================================================================

/// Ingests observations and keeps the published index current.
pub struct PortalService<P, S>
where
    P: PortalStore,
    S: PublicationStore,
{
    store: P,
    tokens: VersionTokenCache<P, S>,
    index_name: String,
}

impl<P, S> Clone for PortalService<P, S>
where
    P: PortalStore + Clone,
    S: PublicationStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tokens: self.tokens.clone(),
            index_name: self.index_name.clone(),
        }
    }
}

impl<P, S> PortalService<P, S>
where
    P: PortalStore,
    S: PublicationStore,
{
    pub fn new(store: P, tokens: VersionTokenCache<P, S>, index_name: impl Into<String>) -> Self {
        Self {
            store,
            tokens,
            index_name: index_name.into(),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Looks up the record carrying `guid`.
    pub async fn get_portal(&self, guid: &str) -> Result<PortalRecord, AppError> {
        self.store
            .get_by_guid(guid)
            .await?
            .ok_or_else(|| AppError::PortalNotFound(guid.to_string()))
    }

    pub async fn ingest(&self, batch: Vec<Observation>) -> Result<IngestReport, AppError> {
        self.ingest_with_reporter(batch, &SilentIngestReporter).await
    }

    /// Validates, merges and, on change, republishes.
    ///
    /// Rejection indices refer to positions in `batch`.
    pub async fn ingest_with_reporter<R: IngestReporter>(
        &self,
        batch: Vec<Observation>,
        reporter: &R,
    ) -> Result<IngestReport, AppError> {
        reporter.report(IngestEvent::BatchReceived { count: batch.len() });

        let mut invalid = MergeResult::new();
        let mut positions = Vec::with_capacity(batch.len());
        let mut valid = Vec::with_capacity(batch.len());

        for (index, observation) in batch.into_iter().enumerate() {
            let guid = observation.guid.clone();
            match observation.normalized() {
                Ok(observation) => {
                    positions.push(index);
                    valid.push(observation);
                }
                Err(e) => {
                    let message = match e {
                        AppError::InvalidObservation(message) => message,
                        other => other.to_string(),
                    };
                    reporter.report(IngestEvent::ObservationInvalid {
                        index,
                        message: &message,
                    });
                    invalid.reject(index, guid, RejectionReason::InvalidObservation { message });
                }
            }
        }

        let merged = if valid.is_empty() {
            Ok(MergeResult::new())
        } else {
            self.store.merge_batch(&valid).await
        };
        let mut result = match merged {
            Ok(result) => result,
            Err(e) => {
                // The applied prefix stays committed, so the index must move on.
                self.republish_after_failure(&e).await;
                return Err(e);
            }
        };
        for rejection in result.rejected.iter_mut() {
            if let Some(position) = positions.get(rejection.index) {
                rejection.index = *position;
            }
        }
        result.absorb(invalid, 0);
        result.rejected.sort_by_key(|r| r.index);

        reporter.report(IngestEvent::BatchMerged { result: &result });

        let published = if result.has_changes() {
            let publication = self.tokens.publish(&self.index_name).await?;
            reporter.report(IngestEvent::IndexPublished {
                token: &publication.token,
            });
            Some(publication.token)
        } else {
            None
        };

        Ok(IngestReport { result, published })
    }

    async fn republish_after_failure(&self, cause: &AppError) {
        match self.tokens.publish(&self.index_name).await {
            Ok(publication) => warn!(
                error = %cause,
                token = %publication.token.token,
                "Batch failed part way, index republished"
            ),
            Err(e) => error!(
                error = %e,
                cause = %cause,
                "Failed to republish index after a failed batch"
            ),
        }
    }
}
