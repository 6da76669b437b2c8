//! Schema management: table/index creation, hard reset, uninstall.
//!
//! Table names are formed by concatenating a configured prefix with the fixed
//! suffixes `job` and `job_attempt_log`. The prefix may carry a schema
//! qualifier (`analytics.app_`); identifiers are double-quoted per dot-part
//! when rendered into SQL.

use sqlx::PgPool;
use tracing::{debug, info};

use conveyor_core::{Error, Result};

/// Fixed suffix of the job table.
pub const JOB_TABLE_SUFFIX: &str = "job";

/// Fixed suffix of the attempt log table.
pub const ATTEMPT_TABLE_SUFFIX: &str = "job_attempt_log";

/// Prefixed, quoting-aware table name pair.
#[derive(Debug, Clone)]
pub struct TableNames {
    prefix: String,
}

impl TableNames {
    /// Create a table name pair from a prefix.
    ///
    /// The prefix may be empty, a plain identifier fragment (`app_`), or a
    /// schema-qualified fragment (`analytics.app_`). Anything that cannot
    /// form a safe identifier is rejected.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Unquoted job table name, e.g. `analytics.app_job`.
    pub fn job(&self) -> String {
        format!("{}{}", self.prefix, JOB_TABLE_SUFFIX)
    }

    /// Unquoted attempt log table name.
    pub fn attempt_log(&self) -> String {
        format!("{}{}", self.prefix, ATTEMPT_TABLE_SUFFIX)
    }

    /// Quoted job table name for SQL interpolation, e.g. `"analytics"."app_job"`.
    pub fn job_quoted(&self) -> String {
        quote_ident(&self.job())
    }

    /// Quoted attempt log table name for SQL interpolation.
    pub fn attempt_log_quoted(&self) -> String {
        quote_ident(&self.attempt_log())
    }

    /// Derive an index name from a table name and column suffix, stripping
    /// non-word characters so the result is always a valid bare identifier.
    pub fn index_name(table: &str, suffix: &str) -> String {
        let sanitized: String = table
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        format!("idx_{sanitized}_{suffix}")
    }
}

/// Quote a possibly schema-qualified identifier per PostgreSQL rules.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Reject prefixes that cannot form a safe identifier: only word characters
/// and at most one schema-qualifying dot are allowed.
fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.matches('.').count() > 1 {
        return Err(Error::InvalidInput(format!(
            "table prefix may contain at most one schema qualifier: {prefix:?}"
        )));
    }
    if prefix.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "table prefix must not start with a dot: {prefix:?}"
        )));
    }
    let ok = prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !ok {
        return Err(Error::InvalidInput(format!(
            "table prefix contains unsafe characters: {prefix:?}"
        )));
    }
    Ok(())
}

/// Owns create/drop of the two tables and their indexes.
#[derive(Clone)]
pub struct SchemaManager {
    pool: PgPool,
    tables: TableNames,
}

impl SchemaManager {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Bring the schema to the expected shape.
    ///
    /// Idempotent when `hard` is false; `hard` drops both tables first.
    pub async fn initialize(&self, hard: bool) -> Result<()> {
        if hard {
            self.drop_tables().await?;
        }
        for statement in self.create_statements() {
            debug!(
                subsystem = "db",
                component = "schema",
                op = "initialize",
                "Executing DDL"
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }
        info!(
            subsystem = "db",
            component = "schema",
            op = "initialize",
            db_table = %self.tables.job(),
            hard,
            "Schema initialized"
        );
        Ok(())
    }

    /// Drop both tables. Safe to call when they do not exist.
    pub async fn uninstall(&self) -> Result<()> {
        self.drop_tables().await?;
        info!(
            subsystem = "db",
            component = "schema",
            op = "uninstall",
            db_table = %self.tables.job(),
            "Schema uninstalled"
        );
        Ok(())
    }

    async fn drop_tables(&self) -> Result<()> {
        // Attempt log first: it holds the foreign key.
        for statement in self.drop_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    /// DDL in execution order: tables first, then indexes.
    pub(crate) fn create_statements(&self) -> Vec<String> {
        let job = self.tables.job_quoted();
        let attempt = self.tables.attempt_log_quoted();
        let job_name = self.tables.job();
        let attempt_name = self.tables.attempt_log();

        vec![
            format!(
                r#"CREATE TABLE IF NOT EXISTS {job} (
                    id SERIAL PRIMARY KEY,
                    uid UUID NOT NULL DEFAULT gen_random_uuid(),
                    type VARCHAR(255) NOT NULL,
                    payload JSONB NOT NULL DEFAULT '{{}}',
                    status VARCHAR(20) NOT NULL DEFAULT 'pending',
                    result JSONB NOT NULL DEFAULT '{{}}',
                    attempts INTEGER DEFAULT 0,
                    max_attempts INTEGER DEFAULT 3,
                    max_attempt_duration_ms INTEGER DEFAULT 0,
                    created_at TIMESTAMPTZ DEFAULT NOW(),
                    updated_at TIMESTAMPTZ DEFAULT NOW(),
                    run_at TIMESTAMPTZ DEFAULT NOW(),
                    started_at TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    backoff_strategy VARCHAR(20) NOT NULL DEFAULT 'exp'
                )"#
            ),
            format!(
                r#"CREATE TABLE IF NOT EXISTS {attempt} (
                    id SERIAL PRIMARY KEY,
                    job_id INTEGER REFERENCES {job}(id),
                    attempt_number INTEGER NOT NULL,
                    started_at TIMESTAMPTZ DEFAULT NOW(),
                    completed_at TIMESTAMPTZ,
                    status VARCHAR(20),
                    error_message TEXT,
                    error_details JSONB
                )"#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {job} (status, run_at)",
                TableNames::index_name(&job_name, "status_run_at")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {job} (uid)",
                TableNames::index_name(&job_name, "uid")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {job} (status)",
                TableNames::index_name(&job_name, "status")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {attempt} (job_id)",
                TableNames::index_name(&attempt_name, "job_id")
            ),
        ]
    }

    pub(crate) fn drop_statements(&self) -> Vec<String> {
        vec![
            format!(
                "DROP TABLE IF EXISTS {}",
                self.tables.attempt_log_quoted()
            ),
            format!("DROP TABLE IF EXISTS {}", self.tables.job_quoted()),
        ]
    }
}
