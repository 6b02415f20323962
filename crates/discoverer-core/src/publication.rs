//! Version tokens and the published portal index.
//!
//! A publication is the latest snapshot of a named resource together with a
//! random version token. Every call to [`VersionTokenCache::publish`] mints a
//! new token, and anything derived from the resource (dataset artifacts, HTTP
//! caches through `ETag`) compares tokens by equality to detect staleness.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::Polygon;
use crate::traits::{PortalStore, PublicationStore};

/// Identifies one published version of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionToken {
    pub name: String,
    pub token: String,
    pub minted_at: DateTime<Utc>,
    pub item_count: u64,
}

impl VersionToken {
    /// Mints a fresh token for `name`.
    pub fn mint(name: impl Into<String>, item_count: u64) -> Self {
        Self {
            name: name.into(),
            token: Uuid::new_v4().to_string(),
            minted_at: Utc::now(),
            item_count,
        }
    }
}

/// Index document handed to clients.
///
/// `k` maps every known guid to its content key so clients can tell unknown
/// or changed portals apart; `r` is the region clients should scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(rename = "k")]
    pub keys: BTreeMap<String, String>,
    #[serde(rename = "r")]
    pub search_region: Option<Polygon>,
}

/// A stored publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub token: VersionToken,
    pub document: IndexDocument,
}

impl Publication {
    pub fn name(&self) -> &str {
        &self.token.name
    }
}

/// Service minting and reading version tokens.
pub struct VersionTokenCache<P, S>
where
    P: PortalStore,
    S: PublicationStore,
{
    portals: P,
    publications: S,
    search_region: Option<Polygon>,
}

impl<P, S> Clone for VersionTokenCache<P, S>
where
    P: PortalStore + Clone,
    S: PublicationStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            portals: self.portals.clone(),
            publications: self.publications.clone(),
            search_region: self.search_region.clone(),
        }
    }
}

impl<P, S> VersionTokenCache<P, S>
where
    P: PortalStore,
    S: PublicationStore,
{
    pub fn new(portals: P, publications: S) -> Self {
        Self {
            portals,
            publications,
            search_region: None,
        }
    }

    /// Includes a search region in every published index document.
    pub fn with_search_region(mut self, region: Option<Polygon>) -> Self {
        self.search_region = region;
        self
    }

    /// The portal store snapshots are computed from.
    pub fn portals(&self) -> &P {
        &self.portals
    }

    /// Recomputes the snapshot and stores it under a freshly minted token.
    ///
    /// Concurrent publishes are not coordinated; the last write wins.
    pub async fn publish(&self, name: &str) -> Result<Publication, AppError> {
        let item_count = self.portals.count().await?;
        let keys = self.portals.guid_index().await?;

        let publication = Publication {
            token: VersionToken::mint(name, item_count),
            document: IndexDocument {
                keys,
                search_region: self.search_region.clone(),
            },
        };
        self.publications.put(&publication).await?;

        info!(
            name,
            token = %publication.token.token,
            item_count,
            "Published index"
        );
        Ok(publication)
    }

    /// Returns the current publication, publishing first if there is none.
    ///
    /// This may write: a missing publication is created synchronously.
    pub async fn current(&self, name: &str) -> Result<Publication, AppError> {
        match self.publications.get(name).await? {
            Some(publication) => Ok(publication),
            None => self.publish(name).await,
        }
    }

    /// Returns the current version token, publishing first if there is none.
    pub async fn get_or_publish(&self, name: &str) -> Result<VersionToken, AppError> {
        Ok(self.current(name).await?.token)
    }

    /// Reads the current publication without ever publishing.
    pub async fn peek(&self, name: &str) -> Result<Option<Publication>, AppError> {
        self.publications.get(name).await
    }
}
