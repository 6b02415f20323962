//! Portal repository for PostgreSQL.
//!
//! Each observation of a batch is merged in its own transaction. The
//! transaction first takes transaction-scoped advisory locks on the
//! observation's identity keys (coordinates, then guid), so concurrent
//! merges touching the same portal are serialized while unrelated ones
//! proceed in parallel.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use discoverer_core::error::AppError;
use discoverer_core::merge::{
    Candidates, MergeDecision, MergeOutcome, MergeResult, RejectionReason, resolve,
};
use discoverer_core::models::{GeoPoint, Observation, PortalIdentity, PortalRecord, PortalVersion};
use discoverer_core::traits::PortalStore;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

// Static queries so list_stream can borrow them for the stream's lifetime.
const SELECT_BY_GUID: &str = "SELECT id, name, guid, lat_e6, lng_e6, region, reporter, content_key, discovered_at, updated_at, history FROM portals WHERE guid = $1";
const SELECT_AT_LOCATION: &str = "SELECT id, name, guid, lat_e6, lng_e6, region, reporter, content_key, discovered_at, updated_at, history FROM portals WHERE lat_e6 = $1 AND lng_e6 = $2 ORDER BY discovered_at";
const LIST_ALL_QUERY: &str = "SELECT id, name, guid, lat_e6, lng_e6, region, reporter, content_key, discovered_at, updated_at, history FROM portals ORDER BY discovered_at, id";

/// Repository for canonical portal records.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use discoverer_db::PortalRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/discoverer")
///     .await?;
///
/// let repo = PortalRepository::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PortalRepository {
    pool: Pool<Postgres>,
}

impl PortalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Merges one observation inside its own transaction.
    async fn merge_one(&self, observation: &Observation) -> Result<Step, AppError> {
        let mut tx = self.pool.begin().await?;

        let location = observation.location();
        let mut lock_keys = vec![PortalIdentity::Location(location).lock_key()];
        if let Some(guid) = &observation.guid {
            lock_keys.push(PortalIdentity::Guid(guid.clone()).lock_key());
        }
        for key in &lock_keys {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        let by_guid: Option<PortalRecord> = match &observation.guid {
            Some(guid) => sqlx::query_as::<_, PortalRow>(SELECT_BY_GUID)
                .bind(guid)
                .fetch_optional(&mut *tx)
                .await?
                .map(Into::into),
            None => None,
        };
        let at_location: Vec<PortalRecord> = sqlx::query_as::<_, PortalRow>(SELECT_AT_LOCATION)
            .bind(location.lat_e6)
            .bind(location.lng_e6)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();

        let now = Utc::now();
        let step = {
            let candidates = Candidates {
                by_guid: by_guid.as_ref(),
                at_location: at_location.iter().collect(),
            };
            match resolve(observation, &candidates) {
                MergeDecision::Insert => Step::Insert(PortalRecord::from_observation(observation, now)),
                MergeDecision::Update(record) => {
                    let mut record = record.clone();
                    record.apply(observation, now);
                    Step::Update(record)
                }
                MergeDecision::Unchanged(_) => Step::Unchanged,
                MergeDecision::GuidMismatch { existing_guid } => Step::Reject(existing_guid),
            }
        };

        match &step {
            Step::Insert(record) => {
                sqlx::query(
                    r#"
                    INSERT INTO portals (
                        id, name, guid, lat_e6, lng_e6, region, reporter,
                        content_key, discovered_at, updated_at, history
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(record.id)
                .bind(&record.name)
                .bind(&record.guid)
                .bind(record.location.lat_e6)
                .bind(record.location.lng_e6)
                .bind(&record.region)
                .bind(&record.reporter)
                .bind(&record.content_key)
                .bind(record.discovered_at)
                .bind(record.updated_at)
                .bind(Json(&record.history))
                .execute(&mut *tx)
                .await?;
            }
            Step::Update(record) => {
                sqlx::query(
                    r#"
                    UPDATE portals
                    SET
                        name = $2,
                        guid = $3,
                        lat_e6 = $4,
                        lng_e6 = $5,
                        region = $6,
                        reporter = $7,
                        content_key = $8,
                        updated_at = $9,
                        history = $10
                    WHERE id = $1
                    "#,
                )
                .bind(record.id)
                .bind(&record.name)
                .bind(&record.guid)
                .bind(record.location.lat_e6)
                .bind(record.location.lng_e6)
                .bind(&record.region)
                .bind(&record.reporter)
                .bind(&record.content_key)
                .bind(record.updated_at)
                .bind(Json(&record.history))
                .execute(&mut *tx)
                .await?;
            }
            Step::Unchanged | Step::Reject(_) => {}
        }

        tx.commit().await?;
        Ok(step)
    }
}

enum Step {
    Insert(PortalRecord),
    Update(PortalRecord),
    Unchanged,
    Reject(String),
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct PortalRow {
    id: Uuid,
    name: String,
    guid: Option<String>,
    lat_e6: i32,
    lng_e6: i32,
    region: Option<String>,
    reporter: Option<String>,
    content_key: String,
    discovered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Json<Vec<PortalVersion>>,
}

impl From<PortalRow> for PortalRecord {
    fn from(row: PortalRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            guid: row.guid,
            location: GeoPoint::new(row.lat_e6, row.lng_e6),
            region: row.region,
            reporter: row.reporter,
            content_key: row.content_key,
            discovered_at: row.discovered_at,
            updated_at: row.updated_at,
            history: row.history.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GuidKeyRow {
    guid: String,
    content_key: String,
}

// =============================================================================
// PortalStore Trait Implementation
// =============================================================================

impl PortalStore for PortalRepository {
    async fn merge_batch(&self, observations: &[Observation]) -> Result<MergeResult, AppError> {
        let mut result = MergeResult::new();
        for (index, observation) in observations.iter().enumerate() {
            match self.merge_one(observation).await? {
                Step::Insert(_) => result.record(MergeOutcome::Inserted),
                Step::Update(_) => result.record(MergeOutcome::Modified),
                Step::Unchanged => result.record(MergeOutcome::Unchanged),
                Step::Reject(existing_guid) => {
                    debug!(
                        index,
                        guid = observation.guid.as_deref(),
                        existing = %existing_guid,
                        "Observation conflicts with another portal"
                    );
                    result.reject(
                        index,
                        observation.guid.clone(),
                        RejectionReason::GuidMismatch { existing_guid },
                    );
                }
            }
        }
        Ok(result)
    }

    async fn get_by_guid(&self, guid: &str) -> Result<Option<PortalRecord>, AppError> {
        let row: Option<PortalRow> = sqlx::query_as(SELECT_BY_GUID)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn find_at(&self, location: GeoPoint) -> Result<Vec<PortalRecord>, AppError> {
        let rows: Vec<PortalRow> = sqlx::query_as(SELECT_AT_LOCATION)
            .bind(location.lat_e6)
            .bind(location.lng_e6)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM portals")
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn guid_index(&self) -> Result<BTreeMap<String, String>, AppError> {
        let rows: Vec<GuidKeyRow> = sqlx::query_as(
            "SELECT guid, content_key FROM portals WHERE guid IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.guid, r.content_key)).collect())
    }

    fn list_stream<'a>(&'a self) -> BoxStream<'a, Result<PortalRecord, AppError>> {
        Box::pin(
            sqlx::query_as::<_, PortalRow>(LIST_ALL_QUERY)
                .fetch(&self.pool)
                .map(|r| r.map(Into::into).map_err(AppError::DatabaseError)),
        )
    }
}
