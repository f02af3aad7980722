//! Postgres-backed job store implementation.
//!
//! The load-bearing statement is the claim:
//!
//! ```sql
//! UPDATE import_jobs SET status = 'running', ... WHERE id = $1 AND status = 'queued'
//! ```
//!
//! The claim carries `RETURNING`, so the winner gets the row exactly as its
//! update left it (no follow-up read that could fail after the claim has
//! committed). Two workers (in any number of processes) reading the same
//! candidate both issue the update; Postgres serializes them on the row and
//! the second one matches zero rows and gets nothing back. No row locks are
//! held between the read and the write. The other status changes report
//! `rows_affected()`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Row decoding / unknown enum text | N/A | `Decode` |
//! | Counter above the column range (checked before binding) | N/A | `OutOfRange` |
//! | Anything else | Any | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use importq_core::{ImportType, JobId, JobStatus, LogLevel, SourceId, UserId};

use super::store::{JobStats, JobStore, StoreError};
use super::types::{Job, JobError, JobLog, Transition};

/// Schema for the three queue tables; idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/0001_import_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id, source_id, import_type, status, created_by,
    total_items, processed_items, error_count, attempt, last_checkpoint,
    created_at, started_at, finished_at
"#;

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the queue tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn to_i64(field: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}

fn to_i32(field: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::OutOfRange {
        field,
        value: u64::from(value),
    })
}

fn parse_enum<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    T::from_str(raw).map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    source_id: Uuid,
    import_type: String,
    status: String,
    created_by: Uuid,
    total_items: i64,
    processed_items: i64,
    error_count: i32,
    attempt: i32,
    last_checkpoint: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            import_type: row.try_get("import_type")?,
            status: row.try_get("status")?,
            created_by: row.try_get("created_by")?,
            total_items: row.try_get("total_items")?,
            processed_items: row.try_get("processed_items")?,
            error_count: row.try_get("error_count")?,
            attempt: row.try_get("attempt")?,
            last_checkpoint: row.try_get("last_checkpoint")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            source_id: SourceId::from_uuid(row.source_id),
            import_type: parse_enum::<ImportType>("import_type", &row.import_type)?,
            status: parse_enum::<JobStatus>("status", &row.status)?,
            created_by: UserId::from_uuid(row.created_by),
            total_items: row.total_items.max(0) as u64,
            processed_items: row.processed_items.max(0) as u64,
            error_count: row.error_count.max(0) as u32,
            attempt: row.attempt.max(0) as u32,
            last_checkpoint: row.last_checkpoint,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| StoreError::Decode(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

fn log_from_row(row: &PgRow) -> Result<JobLog, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(format!("failed to deserialize log row: {e}"));
    let level: String = row.try_get("level").map_err(decode)?;
    Ok(JobLog {
        id: row.try_get("id").map_err(decode)?,
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        level: parse_enum::<LogLevel>("level", &level)?,
        message: row.try_get("message").map_err(decode)?,
        details: row.try_get("details").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn error_from_row(row: &PgRow) -> Result<JobError, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(format!("failed to deserialize error row: {e}"));
    let retry_count: i32 = row.try_get("retry_count").map_err(decode)?;
    Ok(JobError {
        id: row.try_get("id").map_err(decode)?,
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        stage: row.try_get("stage").map_err(decode)?,
        message: row.try_get("message").map_err(decode)?,
        code: row.try_get("code").map_err(decode)?,
        external_id: row.try_get("external_id").map_err(decode)?,
        retry_count: retry_count.max(0) as u32,
        resolved: row.try_get("resolved").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let total_items = to_i64("total_items", job.total_items)?;
        let processed_items = to_i64("processed_items", job.processed_items)?;
        let error_count = to_i32("error_count", job.error_count)?;
        let attempt = to_i32("attempt", job.attempt)?;

        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                id, source_id, import_type, status, created_by,
                total_items, processed_items, error_count, attempt, last_checkpoint,
                created_at, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.source_id.as_uuid())
        .bind(job.import_type.as_str())
        .bind(job.status.as_str())
        .bind(job.created_by.as_uuid())
        .bind(total_items)
        .bind(processed_items)
        .bind(error_count)
        .bind(attempt)
        .bind(job.last_checkpoint.as_deref())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_oldest_queued(&self) -> Result<Option<JobId>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id
            FROM import_jobs
            WHERE status = 'queued'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_oldest_queued", e))?;

        match row {
            Some(row) => {
                let id: Uuid = row
                    .try_get("id")
                    .map_err(|e| map_sqlx_error("find_oldest_queued", e))?;
                Ok(Some(JobId::from_uuid(id)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, started_at), fields(job_id = %job_id), err)]
    async fn claim(
        &self,
        job_id: JobId,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE import_jobs
            SET status = 'running',
                started_at = $2,
                attempt = attempt + 1
            WHERE id = $1 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(started_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn release(&self, job_id: JobId, attempt: u32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = 'queued',
                started_at = NULL
            WHERE id = $1 AND status = 'running' AND attempt = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(to_i32("attempt", attempt)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, at), fields(job_id = %job_id, status = %transition.status()), err)]
    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        transition: Transition,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let error_count: Option<i32> = match transition {
            Transition::Succeeded => None,
            Transition::Requeued { error_count } | Transition::Failed { error_count } => {
                Some(to_i32("error_count", error_count)?)
            }
        };
        let finished_at = transition.sets_finished_at().then_some(at);

        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = $3,
                error_count = COALESCE($4, error_count),
                finished_at = $5
            WHERE id = $1 AND status = 'running' AND attempt = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(to_i32("attempt", attempt)?)
        .bind(transition.status().as_str())
        .bind(error_count)
        .bind(finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn update_progress(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        processed_items: u64,
        total_items: u64,
    ) -> Result<u64, StoreError> {
        let processed = to_i64("processed_items", processed_items)?;
        let total = to_i64("total_items", total_items)?;
        let fence = fence.map(|a| to_i32("attempt", a)).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET processed_items = $2,
                total_items = $3
            WHERE id = $1
                AND ($4::int IS NULL OR (status = 'running' AND attempt = $4))
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(processed)
        .bind(total)
        .bind(fence)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, checkpoint), fields(job_id = %job_id), err)]
    async fn update_checkpoint(
        &self,
        job_id: JobId,
        fence: Option<u32>,
        checkpoint: &str,
    ) -> Result<u64, StoreError> {
        let fence = fence.map(|a| to_i32("attempt", a)).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET last_checkpoint = $2
            WHERE id = $1
                AND ($3::int IS NULL OR (status = 'running' AND attempt = $3))
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(checkpoint)
        .bind(fence)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_checkpoint", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, log), fields(job_id = %log.job_id), err)]
    async fn append_log(&self, log: &JobLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_job_logs (id, job_id, level, message, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.id)
        .bind(log.job_id.as_uuid())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.details)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(job_id = %error.job_id), err)]
    async fn append_error(&self, error: &JobError) -> Result<(), StoreError> {
        let retry_count = to_i32("retry_count", error.retry_count)?;

        sqlx::query(
            r#"
            INSERT INTO import_job_errors (
                id, job_id, stage, message, code, external_id, retry_count, resolved, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(error.id)
        .bind(error.job_id.as_uuid())
        .bind(&error.stage)
        .bind(&error.message)
        .bind(error.code.as_deref())
        .bind(error.external_id.as_deref())
        .bind(retry_count)
        .bind(error.resolved)
        .bind(error.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_error", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, level, message, details, created_at
            FROM import_job_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_logs", e))?;

        rows.iter().map(log_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_errors(&self, job_id: JobId) -> Result<Vec<JobError>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, stage, message, code, external_id, retry_count, resolved, created_at
            FROM import_job_errors
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_errors", e))?;

        rows.iter().map(error_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM import_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM import_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(parse_enum("status", &status)?, total.max(0) as usize);
        }
        Ok(stats)
    }
}
