//! Publication repository for PostgreSQL.

use chrono::{DateTime, Utc};
use discoverer_core::error::AppError;
use discoverer_core::publication::{IndexDocument, Publication, VersionToken};
use discoverer_core::traits::PublicationStore;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

/// Latest publication per resource name. Writes are last-wins.
#[derive(Clone)]
pub struct PublicationRepository {
    pool: Pool<Postgres>,
}

impl PublicationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PublicationRow {
    name: String,
    token: String,
    minted_at: DateTime<Utc>,
    item_count: i64,
    document: Json<IndexDocument>,
}

impl From<PublicationRow> for Publication {
    fn from(row: PublicationRow) -> Self {
        Self {
            token: VersionToken {
                name: row.name,
                token: row.token,
                minted_at: row.minted_at,
                item_count: row.item_count.max(0) as u64,
            },
            document: row.document.0,
        }
    }
}

impl PublicationStore for PublicationRepository {
    async fn get(&self, name: &str) -> Result<Option<Publication>, AppError> {
        let row: Option<PublicationRow> = sqlx::query_as(
            "SELECT name, token, minted_at, item_count, document FROM publications WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn put(&self, publication: &Publication) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO publications (name, token, minted_at, item_count, document)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name)
            DO UPDATE SET
                token = EXCLUDED.token,
                minted_at = EXCLUDED.minted_at,
                item_count = EXCLUDED.item_count,
                document = EXCLUDED.document
            "#,
        )
        .bind(&publication.token.name)
        .bind(&publication.token.token)
        .bind(publication.token.minted_at)
        .bind(publication.token.item_count as i64)
        .bind(Json(&publication.document))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
