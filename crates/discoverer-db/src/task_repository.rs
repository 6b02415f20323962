//! Task repository for PostgreSQL with SELECT FOR UPDATE SKIP LOCKED.
//!
//! Implements the [`TaskQueue`] trait for persistent task storage with safe
//! concurrent claiming using PostgreSQL's row-level locking.

use chrono::{DateTime, Utc};
use discoverer_core::error::AppError;
use discoverer_core::task::{CreateTaskRequest, Task, TaskCounts, TaskKind, TaskStatus};
use discoverer_core::traits::TaskQueue;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL implementation of the task queue.
///
/// Uses `SELECT FOR UPDATE SKIP LOCKED` for safe concurrent task claiming,
/// ensuring that multiple workers can process tasks without conflicts.
#[derive(Clone)]
pub struct TaskRepository {
    pool: Pool<Postgres>,
}

impl TaskRepository {
    /// Create a new task repository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

/// Helper struct for deserializing task rows from the database.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    payload: Json<TaskKind>,
    status: String,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    worker_id: Option<String>,
    dedup_key: Option<String>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            id: row.id,
            kind: row.payload.0,
            status: row.status.parse().unwrap_or(TaskStatus::Pending),
            run_at: row.run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            next_retry_at: row.next_retry_at,
            error_message: row.error_message,
            worker_id: row.worker_id,
            dedup_key: row.dedup_key,
        }
    }
}

// =============================================================================
// TaskQueue Trait Implementation
// =============================================================================

impl TaskQueue for TaskRepository {
    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, AppError> {
        let max_retries = request.max_retries.unwrap_or(3) as i32;
        let dedup_key = request.kind.dedup_key()?;

        // The partial unique index admits one active task per dedup key. A
        // conflicting insert returns nothing and the winner is read back in a
        // fresh statement; if that one finished in between, insert again.
        for _ in 0..3 {
            let inserted: Option<TaskRow> = sqlx::query_as(
                r#"
                INSERT INTO tasks (kind, payload, run_at, max_retries, dedup_key)
                VALUES ($1, $2, COALESCE($3, NOW()), $4, $5)
                ON CONFLICT (dedup_key)
                    WHERE dedup_key IS NOT NULL AND status IN ('pending', 'running')
                    DO NOTHING
                RETURNING *
                "#,
            )
            .bind(request.kind.as_str())
            .bind(Json(&request.kind))
            .bind(request.run_at)
            .bind(max_retries)
            .bind(dedup_key.as_deref())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(row.into());
            }

            let Some(key) = dedup_key.as_deref() else {
                return Err(AppError::Generic("task insert returned no row".to_string()));
            };
            if let Some(existing) = self.find_active_by_key(key).await? {
                debug!(task_id = %existing.id, dedup_key = key, "Active task already queued");
                return Ok(existing);
            }
        }

        Err(AppError::Generic(format!(
            "could not enqueue task {}: dedup key kept changing hands",
            request.kind.as_str()
        )))
    }

    async fn claim_task(&self, worker_id: &str) -> Result<Option<Task>, AppError> {
        // A task is due once both its run_at and any scheduled retry have
        // passed. Earliest due first, then creation order.
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET
                status = 'running',
                worker_id = $1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND run_at <= NOW()
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY
                    GREATEST(run_at, COALESCE(next_retry_at, run_at)) ASC,
                    created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'completed',
                completed_at = NOW(),
                updated_at = NOW(),
                error_message = NULL,
                worker_id = NULL
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        // If next_retry_at is provided, reset to pending for retry.
        // Otherwise, mark as permanently failed.
        let (new_status, should_increment) = if next_retry_at.is_some() {
            (TaskStatus::Pending, true)
        } else {
            (TaskStatus::Failed, false)
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = $2,
                error_message = $3,
                next_retry_at = $4,
                retry_count = CASE WHEN $5 THEN retry_count + 1 ELSE retry_count END,
                updated_at = NOW(),
                completed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE NULL END,
                worker_id = NULL,
                started_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(new_status.as_str())
        .bind(error)
        .bind(next_retry_at)
        .bind(should_increment)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_task(&self, task_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'cancelled',
                completed_at = NOW(),
                updated_at = NOW(),
                worker_id = NULL
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, AppError> {
        let rows: Vec<TaskRow> = if let Some(s) = status {
            sqlx::query_as(
                r#"
                SELECT * FROM tasks
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(s.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT * FROM tasks
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn find_active_by_key(&self, dedup_key: &str) -> Result<Option<Task>, AppError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE dedup_key = $1 AND status IN ('pending', 'running')
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn task_counts(&self) -> Result<TaskCounts, AppError> {
        let (scheduled, reserved, active): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE status = 'pending'
                      AND GREATEST(run_at, COALESCE(next_retry_at, run_at)) > NOW()
                ),
                COUNT(*) FILTER (
                    WHERE status = 'pending'
                      AND GREATEST(run_at, COALESCE(next_retry_at, run_at)) <= NOW()
                ),
                COUNT(*) FILTER (WHERE status = 'running')
            FROM tasks
            WHERE kind <> 'idle_check'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskCounts {
            scheduled: scheduled as u64,
            reserved: reserved as u64,
            active: active as u64,
        })
    }
}
