//! Named advisory locks stored in a table.
//!
//! Unlike `pg_advisory_lock`, a row lock outlives the connection that took
//! it, so a build started by one process can be inspected and, if its
//! holder died, cleared by an operator from another.

use chrono::{DateTime, Utc};
use discoverer_core::error::AppError;
use discoverer_core::lock::{LockEntry, LockHolder};
use discoverer_core::traits::DistributedLock;
use sqlx::{PgPool, Pool, Postgres};

#[derive(Clone)]
pub struct LockRepository {
    pool: Pool<Postgres>,
}

impl LockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LockRow {
    key: String,
    holder: String,
    acquired_at: DateTime<Utc>,
}

impl From<LockRow> for LockEntry {
    fn from(row: LockRow) -> Self {
        Self {
            key: row.key,
            holder: LockHolder::from_token(row.holder),
            acquired_at: row.acquired_at,
        }
    }
}

impl DistributedLock for LockRepository {
    async fn acquire(&self, key: &str) -> Result<Option<LockHolder>, AppError> {
        let holder = LockHolder::generate();
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO locks (key, holder)
            VALUES ($1, $2)
            ON CONFLICT (key) DO NOTHING
            RETURNING holder
            "#,
        )
        .bind(key)
        .bind(holder.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.map(|_| holder))
    }

    async fn release(&self, key: &str, holder: &LockHolder) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<LockEntry>, AppError> {
        let rows: Vec<LockRow> =
            sqlx::query_as("SELECT key, holder, acquired_at FROM locks ORDER BY key")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
