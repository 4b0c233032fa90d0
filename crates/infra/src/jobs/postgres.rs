//! Postgres-backed task store.
//!
//! ## Claim protocol
//!
//! `claim_due_jobs` selects eligible rows with `FOR UPDATE SKIP LOCKED` and
//! flips `is_processing` in the same statement, inside a transaction. Rows
//! locked by a concurrent claimer are skipped rather than waited on, so two
//! schedulers polling the same table never receive the same job.
//!
//! `claimed_at` doubles as the claim token. Job updates and releases only
//! apply while the stored `claimed_at` still equals the one the worker got
//! back from its claim, so a worker whose claim went stale and was taken over
//! cannot clear or overwrite the new holder's state.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Storage` |
//! | begin / commit failures | N/A | `Transaction` |
//! | Row decoding | N/A | `Serialization` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use relayq_core::{
    Clock, Code, HttpVerb, Job, JobId, Output, OutputId, QueueId, ResponseHeaders, SystemClock,
};

use super::store::{PersistSummary, TaskStore, TaskStoreError};

const JOB_COLUMNS: &str = r#"
    id, code, queue_id, title, description, payload, callback_url, http_verb,
    headers, delay, retries, retry_delay, tried_counts, next_execution,
    is_executed, is_successful, is_processing, claimed_at, created_at, updated_at
"#;

const OUTPUT_COLUMNS: &str = r#"
    id, code, job_id, job_code, content, headers, status_code, status_message, created_at
"#;

/// Postgres-backed task store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    stale_claim_after: Option<Duration>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            stale_claim_after: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Treat claims older than `after` as abandoned.
    pub fn with_stale_claim_after(mut self, after: Duration) -> Self {
        self.stale_claim_after = Some(after);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self, job), fields(job_code = %job.code), err)]
    pub async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError> {
        let query = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        sqlx::query(&query)
            .bind(job.id.as_uuid())
            .bind(job.code.as_str())
            .bind(job.queue_id.as_uuid())
            .bind(&job.title)
            .bind(&job.description)
            .bind(&job.payload)
            .bind(&job.callback_url)
            .bind(job.http_verb.as_str())
            .bind(Json(&job.headers))
            .bind(i64::from(job.delay))
            .bind(i64::from(job.retries))
            .bind(i64::from(job.retry_delay))
            .bind(i64::from(job.tried_counts))
            .bind(job.next_execution)
            .bind(job.is_executed)
            .bind(job.is_successful)
            .bind(job.is_processing)
            .bind(job.claimed_at)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    TaskStoreError::AlreadyExists(job.code.clone())
                } else {
                    map_sqlx_error("enqueue", e)
                }
            })?;

        Ok(job.code)
    }

    #[instrument(skip(self), fields(job_code = %code), err)]
    pub async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE code = $1");
        let row = sqlx::query(&query)
            .bind(code.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    #[instrument(skip(self), fields(job_code = %job_code, output_count = tracing::field::Empty), err)]
    pub async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError> {
        let query = format!(
            "SELECT {OUTPUT_COLUMNS} FROM outputs WHERE job_code = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(job_code.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_outputs", e))?;

        let outputs = rows
            .iter()
            .map(decode_output)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("output_count", outputs.len());
        Ok(outputs)
    }

    /// Claim up to `limit` eligible jobs, ordered by id.
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    pub async fn claim_due_jobs(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, TaskStoreError> {
        let now = self.clock.now();
        // A lease reaching past the start of time means nothing is stale yet.
        let stale_before: Option<DateTime<Utc>> = self
            .stale_claim_after
            .and_then(|after| now.checked_sub_signed(after));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TaskStoreError::Transaction(format!("begin claim_due_jobs: {e}")))?;

        let query = format!(
            r#"
            WITH due AS (
                SELECT id FROM jobs
                WHERE tried_counts < retries
                  AND is_successful = FALSE
                  AND next_execution <= $1
                  AND (
                      is_processing = FALSE
                      OR ($4::timestamptz IS NOT NULL AND claimed_at IS NOT NULL AND claimed_at <= $4)
                  )
                ORDER BY id
                LIMIT $2 OFFSET $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET is_processing = TRUE, claimed_at = $1, updated_at = $1
            FROM due
            WHERE jobs.id = due.id
            RETURNING {}
            "#,
            qualified_job_columns()
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .bind(stale_before)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_due_jobs", e))?;

        let mut jobs = rows.iter().map(decode_job).collect::<Result<Vec<_>, _>>()?;

        tx.commit()
            .await
            .map_err(|e| TaskStoreError::Transaction(format!("commit claim_due_jobs: {e}")))?;

        jobs.sort_by_key(|job| job.id);
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, jobs), fields(job_count = jobs.len()), err)]
    pub async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        let mut tx = self.begin("persist_job_updates").await?;
        let updated = update_jobs(&mut tx, jobs).await?;
        commit(tx, "persist_job_updates").await?;
        Ok(updated)
    }

    #[instrument(skip(self, outputs), fields(output_count = outputs.len()), err)]
    pub async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError> {
        let mut tx = self.begin("write_outputs").await?;
        insert_outputs(&mut tx, outputs).await?;
        commit(tx, "write_outputs").await
    }

    #[instrument(
        skip(self, jobs, outputs),
        fields(job_count = jobs.len(), output_count = outputs.len()),
        err
    )]
    pub async fn persist_outcomes(
        &self,
        jobs: &[Job],
        outputs: &[Output],
    ) -> Result<PersistSummary, TaskStoreError> {
        let mut tx = self.begin("persist_outcomes").await?;
        insert_outputs(&mut tx, outputs).await?;
        let jobs_updated = update_jobs(&mut tx, jobs).await?;
        commit(tx, "persist_outcomes").await?;

        Ok(PersistSummary {
            jobs_updated,
            outputs_written: outputs.len() as u64,
        })
    }

    #[instrument(skip(self, jobs), fields(job_count = jobs.len()), err)]
    pub async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        let (codes, tokens): (Vec<String>, Vec<DateTime<Utc>>) = jobs
            .iter()
            .filter_map(|j| j.claimed_at.map(|at| (j.code.as_str().to_string(), at)))
            .unzip();
        if codes.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET is_processing = FALSE, claimed_at = NULL, updated_at = $3
            FROM UNNEST($1::text[], $2::timestamptz[]) AS held (code, claimed_at)
            WHERE jobs.code = held.code
              AND jobs.is_processing = TRUE
              AND jobs.claimed_at = held.claimed_at
            "#,
        )
        .bind(codes)
        .bind(tokens)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_claims", e))?;

        Ok(result.rows_affected())
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, TaskStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| TaskStoreError::Transaction(format!("begin {operation}: {e}")))
    }
}

async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> Result<(), TaskStoreError> {
    tx.commit()
        .await
        .map_err(|e| TaskStoreError::Transaction(format!("commit {operation}: {e}")))
}

async fn update_jobs(
    tx: &mut Transaction<'static, Postgres>,
    jobs: &[Job],
) -> Result<u64, TaskStoreError> {
    let mut updated = 0;
    for job in jobs {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET tried_counts = $2,
                is_executed = $3,
                is_successful = $4,
                next_execution = $5,
                updated_at = $6
            WHERE code = $1 AND claimed_at IS NOT DISTINCT FROM $7
            "#,
        )
        .bind(job.code.as_str())
        .bind(i64::from(job.tried_counts))
        .bind(job.is_executed)
        .bind(job.is_successful)
        .bind(job.next_execution)
        .bind(job.updated_at)
        .bind(job.claimed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;
        updated += result.rows_affected();
    }
    Ok(updated)
}

async fn insert_outputs(
    tx: &mut Transaction<'static, Postgres>,
    outputs: &[Output],
) -> Result<(), TaskStoreError> {
    for output in outputs {
        sqlx::query(&format!(
            "INSERT INTO outputs ({OUTPUT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(output.id.as_uuid())
        .bind(output.code.as_str())
        .bind(output.job_id.as_uuid())
        .bind(output.job_code.as_str())
        .bind(&output.content)
        .bind(Json(&output.headers))
        .bind(i32::from(output.status_code))
        .bind(&output.status_message)
        .bind(output.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TaskStoreError::AlreadyExists(output.code.clone())
            } else if is_foreign_key_violation(&e) {
                TaskStoreError::NotFound(output.job_code.clone())
            } else {
                map_sqlx_error("insert_output", e)
            }
        })?;
    }
    Ok(())
}

fn qualified_job_columns() -> String {
    JOB_COLUMNS
        .split(',')
        .map(|column| format!("jobs.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Map SQLx errors to TaskStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            TaskStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            TaskStoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|c| c.as_ref() == code),
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    code: String,
    queue_id: uuid::Uuid,
    title: String,
    description: Option<String>,
    payload: serde_json::Value,
    callback_url: String,
    http_verb: String,
    headers: Json<BTreeMap<String, String>>,
    delay: i64,
    retries: i64,
    retry_delay: i64,
    tried_counts: i64,
    next_execution: DateTime<Utc>,
    is_executed: bool,
    is_successful: bool,
    is_processing: bool,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            queue_id: row.try_get("queue_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            payload: row.try_get("payload")?,
            callback_url: row.try_get("callback_url")?,
            http_verb: row.try_get("http_verb")?,
            headers: row.try_get("headers")?,
            delay: row.try_get("delay")?,
            retries: row.try_get("retries")?,
            retry_delay: row.try_get("retry_delay")?,
            tried_counts: row.try_get("tried_counts")?,
            next_execution: row.try_get("next_execution")?,
            is_executed: row.try_get("is_executed")?,
            is_successful: row.try_get("is_successful")?,
            is_processing: row.try_get("is_processing")?,
            claimed_at: row.try_get("claimed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn to_u32(column: &str, value: i64) -> Result<u32, TaskStoreError> {
    u32::try_from(value)
        .map_err(|_| TaskStoreError::Serialization(format!("{column} out of range: {value}")))
}

fn to_code(column: &str, value: String) -> Result<Code, TaskStoreError> {
    value
        .parse()
        .map_err(|e| TaskStoreError::Serialization(format!("invalid {column}: {e}")))
}

impl TryFrom<JobRow> for Job {
    type Error = TaskStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            code: to_code("code", row.code)?,
            queue_id: QueueId::from_uuid(row.queue_id),
            title: row.title,
            description: row.description,
            payload: row.payload,
            callback_url: row.callback_url,
            http_verb: HttpVerb::parse_lenient(&row.http_verb),
            headers: row.headers.0,
            delay: to_u32("delay", row.delay)?,
            retries: to_u32("retries", row.retries)?,
            retry_delay: to_u32("retry_delay", row.retry_delay)?,
            tried_counts: to_u32("tried_counts", row.tried_counts)?,
            next_execution: row.next_execution,
            is_executed: row.is_executed,
            is_successful: row.is_successful,
            is_processing: row.is_processing,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct OutputRow {
    id: uuid::Uuid,
    code: String,
    job_id: uuid::Uuid,
    job_code: String,
    content: String,
    headers: Json<ResponseHeaders>,
    status_code: i32,
    status_message: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for OutputRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutputRow {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            job_id: row.try_get("job_id")?,
            job_code: row.try_get("job_code")?,
            content: row.try_get("content")?,
            headers: row.try_get("headers")?,
            status_code: row.try_get("status_code")?,
            status_message: row.try_get("status_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<OutputRow> for Output {
    type Error = TaskStoreError;

    fn try_from(row: OutputRow) -> Result<Self, Self::Error> {
        Ok(Output {
            id: OutputId::from_uuid(row.id),
            code: to_code("code", row.code)?,
            job_id: JobId::from_uuid(row.job_id),
            job_code: to_code("job_code", row.job_code)?,
            content: row.content,
            headers: row.headers.0,
            status_code: u16::try_from(row.status_code).map_err(|_| {
                TaskStoreError::Serialization(format!("status_code out of range: {}", row.status_code))
            })?,
            status_message: row.status_message,
            created_at: row.created_at,
        })
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, TaskStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| TaskStoreError::Serialization(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

fn decode_output(row: &sqlx::postgres::PgRow) -> Result<Output, TaskStoreError> {
    let row = OutputRow::from_row(row)
        .map_err(|e| TaskStoreError::Serialization(format!("failed to deserialize output row: {e}")))?;
    Output::try_from(row)
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError> {
        PostgresTaskStore::enqueue(self, job).await
    }

    async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError> {
        PostgresTaskStore::get_job(self, code).await
    }

    async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError> {
        PostgresTaskStore::list_outputs(self, job_code).await
    }

    async fn claim_due_jobs(&self, limit: usize, offset: usize) -> Result<Vec<Job>, TaskStoreError> {
        PostgresTaskStore::claim_due_jobs(self, limit, offset).await
    }

    async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        PostgresTaskStore::persist_job_updates(self, jobs).await
    }

    async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError> {
        PostgresTaskStore::write_outputs(self, outputs).await
    }

    async fn persist_outcomes(
        &self,
        jobs: &[Job],
        outputs: &[Output],
    ) -> Result<PersistSummary, TaskStoreError> {
        PostgresTaskStore::persist_outcomes(self, jobs, outputs).await
    }

    async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
        PostgresTaskStore::release_claims(self, jobs).await
    }
}
