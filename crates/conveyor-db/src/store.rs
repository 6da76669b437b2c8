//! PostgreSQL job store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use conveyor_core::{
    backoff_delay, AttemptStatus, BackoffStrategy, CreateJobRequest, Error, HealthPreviewRow, Job,
    JobAttempt, JobStatus, JobStore, ListJobsRequest, QueueStats, Result,
};

use crate::schema::TableNames;

/// Column list returned by every job query, in `parse_job_row` order.
const JOB_COLUMNS: &str = "id, uid, type, payload, status, result, attempts, max_attempts, \
     max_attempt_duration_ms, created_at, updated_at, run_at, started_at, completed_at, \
     backoff_strategy";

/// PostgreSQL implementation of [`JobStore`].
///
/// Query text depends on the configured table prefix, so the statements are
/// rendered once at construction and reused for the lifetime of the store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    tables: TableNames,
    insert_sql: String,
    claim_sql: String,
    find_sql: String,
    attempt_insert_sql: String,
}

impl PgJobStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        let job = tables.job_quoted();
        let attempt = tables.attempt_log_quoted();

        let insert_sql = format!(
            "INSERT INTO {job} \
                 (type, payload, max_attempts, backoff_strategy, max_attempt_duration_ms, run_at) \
             VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW())) \
             RETURNING {JOB_COLUMNS}"
        );

        // Single-statement claim: the inner SELECT takes the row lock with
        // SKIP LOCKED so concurrent claimers never block on or double-claim
        // the same row, and the UPDATE transitions it in the same snapshot.
        let claim_sql = format!(
            "UPDATE {job} \
             SET status = 'running', started_at = NOW(), updated_at = NOW(), \
                 attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM {job} \
                 WHERE status = 'pending' AND run_at <= NOW() \
                 ORDER BY id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );

        let find_sql = format!("SELECT {JOB_COLUMNS} FROM {job} WHERE uid = $1");

        let attempt_insert_sql = format!(
            "INSERT INTO {attempt} (job_id, attempt_number) VALUES ($1, $2) RETURNING id"
        );

        Self {
            pool,
            tables,
            insert_sql,
            claim_sql,
            find_sql,
            attempt_insert_sql,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    fn parse_job_row(row: PgRow) -> Job {
        let status: String = row.get("status");
        let backoff: String = row.get("backoff_strategy");
        Job {
            id: row.get("id"),
            uid: row.get("uid"),
            job_type: row.get("type"),
            payload: row.get("payload"),
            status: JobStatus::from_db(&status),
            result: row.get("result"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            max_attempt_duration_ms: row.get("max_attempt_duration_ms"),
            backoff_strategy: BackoffStrategy::from_db(&backoff),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            run_at: row.get("run_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    fn parse_attempt_row(row: PgRow) -> JobAttempt {
        let status: Option<String> = row.get("status");
        JobAttempt {
            id: row.get("id"),
            job_id: row.get("job_id"),
            attempt_number: row.get("attempt_number"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            status: status.as_deref().and_then(AttemptStatus::from_db),
            error_message: row.get("error_message"),
            error_details: row.get("error_details"),
        }
    }

    #[cfg(test)]
    pub(crate) fn claim_sql(&self) -> &str {
        &self.claim_sql
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, request: &CreateJobRequest) -> Result<Job> {
        request.validate()?;

        let row = sqlx::query(&self.insert_sql)
            .bind(&request.job_type)
            .bind(&request.payload)
            .bind(request.max_attempts)
            .bind(request.backoff_strategy.as_str())
            .bind(request.max_attempt_duration_ms)
            .bind(request.run_at)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        let job = Self::parse_job_row(row);
        debug!(
            subsystem = "store",
            op = "insert",
            job_id = job.id,
            job_uid = %job.uid,
            job_type = %job.job_type,
            "Job created"
        );
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let row = sqlx::query(&self.claim_sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_job_row))
    }

    async fn log_attempt_start(&self, job: &Job) -> Result<i32> {
        let id: i32 = sqlx::query_scalar(&self.attempt_insert_sql)
            .bind(job.id)
            .bind(job.attempts)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn complete(&self, job_id: i32, attempt_log_id: i32, result: &JsonValue) -> Result<Job> {
        let job_table = self.tables.job_quoted();
        let attempt_table = self.tables.attempt_log_quoted();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "UPDATE {job_table} \
             SET status = 'completed', completed_at = NOW(), updated_at = NOW(), result = $1 \
             WHERE id = $2 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(result)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(&format!(
            "UPDATE {attempt_table} SET status = 'success', completed_at = NOW() WHERE id = $1"
        ))
        .bind(attempt_log_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(Self::parse_job_row(row))
    }

    async fn fail_or_requeue(&self, job: &Job, attempt_log_id: i32, error: &Error) -> Result<Job> {
        let job_table = self.tables.job_quoted();
        let attempt_table = self.tables.attempt_log_quoted();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(&format!(
            "UPDATE {attempt_table} \
             SET status = 'error', completed_at = NOW(), error_message = $1, error_details = $2 \
             WHERE id = $3"
        ))
        .bind(error.attempt_message())
        .bind(error.attempt_details())
        .bind(attempt_log_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let row = if job.attempts >= job.max_attempts {
            sqlx::query(&format!(
                "UPDATE {job_table} \
                 SET status = 'failed', completed_at = NOW(), updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(job.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?
        } else {
            let delay = backoff_delay(job.attempts, job.backoff_strategy);
            let run_at: DateTime<Utc> = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            sqlx::query(&format!(
                "UPDATE {job_table} \
                 SET status = 'pending', run_at = $1, updated_at = NOW() \
                 WHERE id = $2 \
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(run_at)
            .bind(job.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?
        };

        tx.commit().await.map_err(Error::Database)?;
        Ok(Self::parse_job_row(row))
    }

    async fn find(&self, uid: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&self.find_sql)
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(Self::parse_job_row))
    }

    async fn fetch_all(&self, request: &ListJobsRequest) -> Result<Vec<Job>> {
        let job_table = self.tables.job_quoted();

        let mut conditions = Vec::new();
        let mut param_idx = 1;
        if request.status.is_some() {
            conditions.push(format!("status = ${param_idx}"));
            param_idx += 1;
        }
        if request.since_minutes.is_some() {
            conditions.push(format!(
                "created_at >= NOW() - make_interval(mins => ${param_idx}::int)"
            ));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let order = if request.ascending { "ASC" } else { "DESC" };

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM {job_table} {where_clause} \
             ORDER BY id {order} LIMIT ${param_idx} OFFSET ${}",
            param_idx + 1
        );

        let mut q = sqlx::query(&query);
        if let Some(status) = request.status {
            q = q.bind(status.as_str());
        }
        if let Some(mins) = request.since_minutes {
            q = q.bind(mins);
        }
        q = q.bind(request.limit).bind(request.offset);

        let rows = q.fetch_all(&self.pool).await.map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_job_row).collect())
    }

    async fn fetch_attempts(&self, job_id: i32) -> Result<Vec<JobAttempt>> {
        let attempt_table = self.tables.attempt_log_quoted();
        let rows = sqlx::query(&format!(
            "SELECT id, job_id, attempt_number, started_at, completed_at, status, \
                    error_message, error_details \
             FROM {attempt_table} WHERE job_id = $1 ORDER BY id ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_attempt_row).collect())
    }

    async fn mark_expired(&self, max_running_minutes: i64) -> Result<u64> {
        let job_table = self.tables.job_quoted();
        let result = sqlx::query(&format!(
            "UPDATE {job_table} \
             SET status = 'expired', completed_at = NOW(), updated_at = NOW() \
             WHERE status = 'running' \
               AND started_at < NOW() - make_interval(mins => $1::int)"
        ))
        .bind(max_running_minutes)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let affected = result.rows_affected();
        if affected > 0 {
            debug!(
                subsystem = "store",
                op = "mark_expired",
                row_count = affected,
                "Expired stuck running jobs"
            );
        }
        Ok(affected)
    }

    async fn health_preview(&self, since_minutes: i64) -> Result<Vec<HealthPreviewRow>> {
        let job_table = self.tables.job_quoted();
        let rows = sqlx::query(&format!(
            "SELECT status, \
                    COUNT(*) AS count, \
                    AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::double precision \
                        AS avg_duration_seconds \
             FROM {job_table} \
             WHERE created_at >= NOW() - make_interval(mins => $1::int) \
             GROUP BY status \
             ORDER BY status"
        ))
        .bind(since_minutes)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                HealthPreviewRow {
                    status: JobStatus::from_db(&status),
                    count: row.get("count"),
                    avg_duration_seconds: row.get("avg_duration_seconds"),
                }
            })
            .collect())
    }

    async fn pending_count(&self) -> Result<i64> {
        let job_table = self.tables.job_quoted();
        let count: i64 =
            sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {job_table} WHERE status = 'pending'"
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let job_table = self.tables.job_quoted();
        let row = sqlx::query(&format!(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                COUNT(*) FILTER (WHERE status = 'running') AS running, \
                COUNT(*) FILTER (WHERE status = 'completed' \
                    AND completed_at > NOW() - INTERVAL '1 hour') AS completed_last_hour, \
                COUNT(*) FILTER (WHERE status = 'failed' \
                    AND completed_at > NOW() - INTERVAL '1 hour') AS failed_last_hour, \
                COUNT(*) AS total \
             FROM {job_table}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            completed_last_hour: row.get("completed_last_hour"),
            failed_last_hour: row.get("failed_last_hour"),
            total: row.get("total"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_for(prefix: &str) -> PgJobStore {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/conveyor")
            .expect("lazy pool");
        PgJobStore::new(pool, TableNames::new(prefix).unwrap())
    }

    #[tokio::test]
    async fn test_claim_sql_shape() {
        let store = store_for("app_");
        let sql = store.claim_sql();
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("status = 'pending' AND run_at <= NOW()"));
        assert!(sql.contains("ORDER BY id ASC"));
        assert!(sql.contains("LIMIT 1"));
        assert!(sql.contains("attempts = attempts + 1"));
        assert!(sql.contains("\"app_job\""));
    }

    #[tokio::test]
    async fn test_insert_sql_defaults_run_at_to_now() {
        let store = store_for("");
        assert!(store.insert_sql.contains("COALESCE($6, NOW())"));
        assert!(store.insert_sql.contains("RETURNING"));
    }

    #[tokio::test]
    async fn test_prefixed_tables_flow_into_queries() {
        let store = store_for("analytics.app_");
        assert!(store.find_sql.contains("\"analytics\".\"app_job\""));
        assert!(store
            .attempt_insert_sql
            .contains("\"analytics\".\"app_job_attempt_log\""));
    }
}
