//! Dataset artifact repository for PostgreSQL.
//!
//! While a row is `building`, the `previous_*` columns hold the last `ready`
//! state so a failed build can be rolled back without a second table.

use chrono::{DateTime, Utc};
use discoverer_core::dataset::{ArtifactStatus, DatasetAddress, DatasetArtifact};
use discoverer_core::error::AppError;
use discoverer_core::export::DatasetFormat;
use discoverer_core::traits::ArtifactStore;
use sqlx::{PgPool, Pool, Postgres};

const ARTIFACT_COLUMNS: &str =
    "name, format, config_hash, source_token, status, payload_ref, created_at, updated_at";

#[derive(Clone)]
pub struct ArtifactRepository {
    pool: Pool<Postgres>,
}

impl ArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    name: String,
    format: String,
    config_hash: String,
    source_token: String,
    status: String,
    payload_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for DatasetArtifact {
    type Error = AppError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        let format = row
            .format
            .parse::<DatasetFormat>()
            .map_err(|e| AppError::Generic(format!("corrupt artifact row: {}", e)))?;
        let status = row
            .status
            .parse::<ArtifactStatus>()
            .map_err(|e| AppError::Generic(format!("corrupt artifact row: {}", e)))?;

        Ok(Self {
            name: row.name,
            format,
            config_hash: row.config_hash,
            source_token: row.source_token,
            status,
            payload_ref: row.payload_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl ArtifactStore for ArtifactRepository {
    async fn find(&self, address: &DatasetAddress) -> Result<Option<DatasetArtifact>, AppError> {
        let query = format!(
            "SELECT {} FROM dataset_artifacts WHERE name = $1 AND format = $2 AND config_hash = $3",
            ARTIFACT_COLUMNS
        );
        let row: Option<ArtifactRow> = sqlx::query_as(&query)
            .bind(&address.name)
            .bind(address.format.as_str())
            .bind(&address.config_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DatasetArtifact::try_from).transpose()
    }

    async fn begin_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
    ) -> Result<DatasetArtifact, AppError> {
        // A row that is already building keeps the saved ready state it had.
        let query = format!(
            r#"
            INSERT INTO dataset_artifacts (name, format, config_hash, source_token, status)
            VALUES ($1, $2, $3, $4, 'building')
            ON CONFLICT (name, format, config_hash)
            DO UPDATE SET
                previous_source_token = CASE WHEN dataset_artifacts.status = 'ready'
                    THEN dataset_artifacts.source_token
                    ELSE dataset_artifacts.previous_source_token END,
                previous_payload_ref = CASE WHEN dataset_artifacts.status = 'ready'
                    THEN dataset_artifacts.payload_ref
                    ELSE dataset_artifacts.previous_payload_ref END,
                previous_updated_at = CASE WHEN dataset_artifacts.status = 'ready'
                    THEN dataset_artifacts.updated_at
                    ELSE dataset_artifacts.previous_updated_at END,
                status = 'building',
                source_token = EXCLUDED.source_token,
                payload_ref = NULL,
                updated_at = NOW()
            RETURNING {}
            "#,
            ARTIFACT_COLUMNS
        );
        let row: ArtifactRow = sqlx::query_as(&query)
            .bind(&address.name)
            .bind(address.format.as_str())
            .bind(&address.config_hash)
            .bind(source_token)
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn complete_build(
        &self,
        address: &DatasetAddress,
        source_token: &str,
        payload_ref: &str,
    ) -> Result<DatasetArtifact, AppError> {
        let query = format!(
            r#"
            UPDATE dataset_artifacts
            SET
                status = 'ready',
                source_token = $4,
                payload_ref = $5,
                updated_at = NOW(),
                previous_source_token = NULL,
                previous_payload_ref = NULL,
                previous_updated_at = NULL
            WHERE name = $1 AND format = $2 AND config_hash = $3
            RETURNING {}
            "#,
            ARTIFACT_COLUMNS
        );
        let row: Option<ArtifactRow> = sqlx::query_as(&query)
            .bind(&address.name)
            .bind(address.format.as_str())
            .bind(&address.config_hash)
            .bind(source_token)
            .bind(payload_ref)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(AppError::StorageError(format!(
                "no build in progress for {}",
                address
            ))),
        }
    }

    async fn rollback_build(
        &self,
        address: &DatasetAddress,
    ) -> Result<Option<DatasetArtifact>, AppError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM dataset_artifacts
            WHERE name = $1 AND format = $2 AND config_hash = $3
              AND previous_source_token IS NULL
            "#,
        )
        .bind(&address.name)
        .bind(address.format.as_str())
        .bind(&address.config_hash)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() > 0 {
            return Ok(None);
        }

        let query = format!(
            r#"
            UPDATE dataset_artifacts
            SET
                status = 'ready',
                source_token = previous_source_token,
                payload_ref = previous_payload_ref,
                updated_at = previous_updated_at,
                previous_source_token = NULL,
                previous_payload_ref = NULL,
                previous_updated_at = NULL
            WHERE name = $1 AND format = $2 AND config_hash = $3
            RETURNING {}
            "#,
            ARTIFACT_COLUMNS
        );
        let row: Option<ArtifactRow> = sqlx::query_as(&query)
            .bind(&address.name)
            .bind(address.format.as_str())
            .bind(&address.config_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DatasetArtifact::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<DatasetArtifact>, AppError> {
        let query = format!(
            "SELECT {} FROM dataset_artifacts ORDER BY updated_at DESC",
            ARTIFACT_COLUMNS
        );
        let rows: Vec<ArtifactRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        rows.into_iter().map(DatasetArtifact::try_from).collect()
    }
}
