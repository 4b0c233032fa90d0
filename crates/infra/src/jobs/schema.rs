//! Postgres schema: the client → project → queue tree, jobs and outputs.

use sqlx::PgPool;
use tracing::info;

use super::store::TaskStoreError;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS clients (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        token TEXT NOT NULL UNIQUE,
        is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id UUID PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        client_id UUID NOT NULL REFERENCES clients (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queues (
        id UUID PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        project_id UUID NOT NULL REFERENCES projects (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        delay BIGINT NOT NULL DEFAULT 0 CHECK (delay >= 0),
        retries BIGINT NOT NULL DEFAULT 1 CHECK (retries >= 0),
        retry_delay BIGINT NOT NULL DEFAULT 0 CHECK (retry_delay >= 0),
        callback_url TEXT,
        http_verb TEXT NOT NULL DEFAULT 'GET',
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    -- queue_id is not a foreign key: jobs can be enqueued before their queue row exists.
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        queue_id UUID NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        payload JSONB NOT NULL DEFAULT 'null'::jsonb,
        callback_url TEXT NOT NULL,
        http_verb TEXT NOT NULL DEFAULT 'GET',
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        delay BIGINT NOT NULL DEFAULT 0 CHECK (delay >= 0),
        retries BIGINT NOT NULL DEFAULT 1 CHECK (retries >= 0),
        retry_delay BIGINT NOT NULL DEFAULT 0 CHECK (retry_delay >= 0),
        tried_counts BIGINT NOT NULL DEFAULT 0 CHECK (tried_counts >= 0),
        next_execution TIMESTAMPTZ NOT NULL,
        is_executed BOOLEAN NOT NULL DEFAULT FALSE,
        is_successful BOOLEAN NOT NULL DEFAULT FALSE,
        is_processing BOOLEAN NOT NULL DEFAULT FALSE,
        claimed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_due_idx
        ON jobs (next_execution)
        WHERE is_successful = FALSE
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outputs (
        id UUID PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        job_code TEXT NOT NULL,
        content TEXT NOT NULL,
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        status_code INTEGER NOT NULL,
        status_message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outputs_job_code_idx
        ON outputs (job_code, created_at)
    "#,
];

/// Create the tables and indexes if they are missing. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), TaskStoreError> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| TaskStoreError::Storage(format!("failed to apply schema: {e}")))?;
    }
    info!(statements = STATEMENTS.len(), "task store schema ready");
    Ok(())
}
