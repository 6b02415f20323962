//! Database schema.

use discoverer_core::error::AppError;
use sqlx::PgPool;
use tracing::info;

/// Schema statements, applied in order. Every statement is idempotent.
/// Each statement must be executed separately due to sqlx limitations.
pub const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS portals (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        guid TEXT,
        lat_e6 INTEGER NOT NULL,
        lng_e6 INTEGER NOT NULL,
        region TEXT,
        reporter TEXT,
        content_key VARCHAR(64) NOT NULL,
        discovered_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        history JSONB NOT NULL DEFAULT '[]'::jsonb,
        CONSTRAINT uk_portals_guid UNIQUE (guid)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_portals_location ON portals(lat_e6, lng_e6)",
    "CREATE INDEX IF NOT EXISTS idx_portals_discovered ON portals(discovered_at)",
    r#"CREATE TABLE IF NOT EXISTS publications (
        name TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        minted_at TIMESTAMPTZ NOT NULL,
        item_count BIGINT NOT NULL,
        document JSONB NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS locks (
        key TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS dataset_artifacts (
        name TEXT NOT NULL,
        format TEXT NOT NULL,
        config_hash VARCHAR(64) NOT NULL,
        source_token TEXT NOT NULL,
        status TEXT NOT NULL,
        payload_ref TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        previous_source_token TEXT,
        previous_payload_ref TEXT,
        previous_updated_at TIMESTAMPTZ,
        PRIMARY KEY (name, format, config_hash)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS worker_activity (
        id SMALLINT PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        last_activity_at TIMESTAMPTZ,
        state TEXT NOT NULL DEFAULT 'idle'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tasks (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at TIMESTAMPTZ,
        error_message TEXT,
        worker_id TEXT,
        dedup_key TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, run_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_dedup ON tasks(dedup_key) WHERE dedup_key IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedup_active ON tasks(dedup_key) \
     WHERE dedup_key IS NOT NULL AND status IN ('pending', 'running')",
    "CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id) WHERE worker_id IS NOT NULL",
];

/// Applies [`MIGRATIONS`] to the database.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    for migration in MIGRATIONS {
        sqlx::query(migration).execute(pool).await?;
    }
    info!(statements = MIGRATIONS.len(), "Database schema up to date");
    Ok(())
}
