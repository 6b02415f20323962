//! Worker heartbeat, stored as a single row.

use chrono::{DateTime, Utc};
use discoverer_core::error::AppError;
use discoverer_core::idle::WorkerState;
use discoverer_core::traits::ActivityStore;
use sqlx::{PgPool, Pool, Postgres};

#[derive(Clone)]
pub struct ActivityRepository {
    pool: Pool<Postgres>,
}

impl ActivityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ActivityStore for ActivityRepository {
    async fn record_activity(&self, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO worker_activity (id, last_activity_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET last_activity_at = EXCLUDED.last_activity_at
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_activity(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let row: Option<(Option<DateTime<Utc>>,)> =
            sqlx::query_as("SELECT last_activity_at FROM worker_activity WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(at,)| at))
    }

    async fn set_state(&self, state: WorkerState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO worker_activity (id, state)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn state(&self) -> Result<WorkerState, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM worker_activity WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .and_then(|(state,)| state.parse().ok())
            .unwrap_or_default())
    }
}
