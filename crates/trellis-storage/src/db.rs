//! Uniform SQL client over the two back-ends
//!
//! One `DbClient` is one SQL connection. Methods are the uniform surface
//! the drivers are written against: `exec` for DDL, `run` for writes,
//! `get`/`all`/`each` for reads, plus placeholder generation so composed
//! statements stay portable.
//!
//! Back-end setup:
//! - sqlite opens in WAL mode (file-backed) with a busy timeout; at most
//!   one write transaction is open at a time and a concurrent second writer
//!   observes BUSY.
//! - postgres write transactions run at REPEATABLE READ with a 1s lock
//!   timeout and a 2s idle-in-transaction timeout.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::debug;

use crate::error::{Result, StorageError};

/// A typed SQL parameter
#[derive(Clone, Debug)]
pub enum SqlParam {
    /// 64-bit integer (times, lengths, flags)
    Int(i64),
    /// Byte string (ids, hashes, images, fragments)
    Bytes(Vec<u8>),
    /// Text
    Text(String),
    /// Boolean
    Bool(bool),
    /// NULL typed as a byte string
    NullBytes,
    /// NULL typed as an integer
    NullInt,
}

impl SqlParam {
    /// Convenience constructor for unsigned millisecond times
    pub fn time(value: u64) -> Self {
        SqlParam::Int(value as i64)
    }
}

/// One result row from either back-end
pub enum SqlRow {
    Sqlite(SqliteRow),
    Postgres(PgRow),
}

impl SqlRow {
    pub fn bytes(&self, column: &str) -> Result<Vec<u8>> {
        match self {
            SqlRow::Sqlite(row) => Ok(row.try_get::<Vec<u8>, _>(column)?),
            SqlRow::Postgres(row) => Ok(row.try_get::<Vec<u8>, _>(column)?),
        }
    }

    pub fn opt_bytes(&self, column: &str) -> Result<Option<Vec<u8>>> {
        match self {
            SqlRow::Sqlite(row) => Ok(row.try_get::<Option<Vec<u8>>, _>(column)?),
            SqlRow::Postgres(row) => Ok(row.try_get::<Option<Vec<u8>>, _>(column)?),
        }
    }

    pub fn int(&self, column: &str) -> Result<i64> {
        match self {
            SqlRow::Sqlite(row) => Ok(row.try_get::<i64, _>(column)?),
            SqlRow::Postgres(row) => Ok(row.try_get::<i64, _>(column)?),
        }
    }

    pub fn opt_int(&self, column: &str) -> Result<Option<i64>> {
        match self {
            SqlRow::Sqlite(row) => Ok(row.try_get::<Option<i64>, _>(column)?),
            SqlRow::Postgres(row) => Ok(row.try_get::<Option<i64>, _>(column)?),
        }
    }

    pub fn bool(&self, column: &str) -> Result<bool> {
        match self {
            SqlRow::Sqlite(row) => Ok(row.try_get::<bool, _>(column)?),
            SqlRow::Postgres(row) => Ok(row.try_get::<bool, _>(column)?),
        }
    }

    /// A 32-byte hash/id column
    pub fn id32(&self, column: &str) -> Result<[u8; 32]> {
        let bytes = self.bytes(column)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Db(format!("column {column} is not 32 bytes")))
    }
}

/// One SQL connection to either back-end
pub enum DbClient {
    Sqlite(SqliteConnection),
    Postgres(PgConnection),
}

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                SqlParam::Int(v) => query.bind(*v),
                SqlParam::Bytes(v) => query.bind(v.clone()),
                SqlParam::Text(v) => query.bind(v.clone()),
                SqlParam::Bool(v) => query.bind(*v),
                SqlParam::NullBytes => query.bind(None::<Vec<u8>>),
                SqlParam::NullInt => query.bind(None::<i64>),
            };
        }
        query
    }};
}

impl DbClient {
    /// Open a sqlite connection; file-backed databases use WAL
    pub async fn connect_sqlite(url: &str) -> Result<Self> {
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(1_000));
        if !url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let conn = options.connect().await?;
        Ok(DbClient::Sqlite(conn))
    }

    /// Open a postgres connection with the driver's session timeouts
    pub async fn connect_postgres(url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let mut conn = options.connect().await?;
        sqlx::query("SET lock_timeout = '1s'")
            .execute(&mut conn)
            .await?;
        sqlx::query("SET idle_in_transaction_session_timeout = '2s'")
            .execute(&mut conn)
            .await?;
        Ok(DbClient::Postgres(conn))
    }

    /// Whether this client speaks to the embedded back-end
    pub fn is_sqlite(&self) -> bool {
        matches!(self, DbClient::Sqlite(_))
    }

    // === Placeholders ===

    /// Render the placeholder for 1-based parameter `n`
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            DbClient::Sqlite(_) => "?".to_string(),
            DbClient::Postgres(_) => format!("${n}"),
        }
    }

    /// Render a comma-separated placeholder list for parameters
    /// `start..start + count` (1-based)
    pub fn placeholders(&self, count: usize, start: usize) -> String {
        (0..count)
            .map(|i| self.placeholder(start + i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // === Statement surface ===

    /// Execute a statement without parameters (DDL, transaction control)
    pub async fn exec(&mut self, sql: &str) -> Result<()> {
        match self {
            DbClient::Sqlite(conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
            DbClient::Postgres(conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    /// Execute a statement, returning the number of affected rows
    pub async fn run(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        match self {
            DbClient::Sqlite(conn) => {
                let result = bind_params!(sqlx::query(sql), params)
                    .execute(&mut *conn)
                    .await?;
                Ok(result.rows_affected())
            }
            DbClient::Postgres(conn) => {
                let result = bind_params!(sqlx::query(sql), params)
                    .execute(&mut *conn)
                    .await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Fetch all rows
    pub async fn all(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<SqlRow>> {
        match self {
            DbClient::Sqlite(conn) => {
                let rows = bind_params!(sqlx::query(sql), params)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows.into_iter().map(SqlRow::Sqlite).collect())
            }
            DbClient::Postgres(conn) => {
                let rows = bind_params!(sqlx::query(sql), params)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows.into_iter().map(SqlRow::Postgres).collect())
            }
        }
    }

    /// Fetch at most one row
    pub async fn get(&mut self, sql: &str, params: &[SqlParam]) -> Result<Option<SqlRow>> {
        match self {
            DbClient::Sqlite(conn) => {
                let row = bind_params!(sqlx::query(sql), params)
                    .fetch_optional(&mut *conn)
                    .await?;
                Ok(row.map(SqlRow::Sqlite))
            }
            DbClient::Postgres(conn) => {
                let row = bind_params!(sqlx::query(sql), params)
                    .fetch_optional(&mut *conn)
                    .await?;
                Ok(row.map(SqlRow::Postgres))
            }
        }
    }

    /// Fetch all rows, invoking the callback per row
    pub async fn each<F>(&mut self, sql: &str, params: &[SqlParam], mut callback: F) -> Result<()>
    where
        F: FnMut(SqlRow) -> Result<()>,
    {
        for row in self.all(sql, params).await? {
            callback(row)?;
        }
        Ok(())
    }

    // === Transactions ===

    /// Begin a write transaction
    ///
    /// sqlite takes the write lock up front; postgres runs the transaction
    /// at REPEATABLE READ.
    pub async fn begin_write(&mut self) -> Result<()> {
        match self {
            DbClient::Sqlite(_) => self.exec("BEGIN IMMEDIATE").await,
            DbClient::Postgres(_) => self.exec("BEGIN ISOLATION LEVEL REPEATABLE READ").await,
        }
    }

    /// Begin a snapshot read transaction
    pub async fn begin_read(&mut self) -> Result<()> {
        self.exec("BEGIN").await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.exec("COMMIT").await
    }

    /// Roll back; failure to roll back is logged, not raised
    pub async fn rollback(&mut self) -> Result<()> {
        if let Err(err) = self.exec("ROLLBACK").await {
            debug!(error = %err, "rollback failed");
        }
        Ok(())
    }

    /// Health check
    pub async fn ping(&mut self) -> Result<()> {
        match self {
            DbClient::Sqlite(conn) => Ok(conn.ping().await?),
            DbClient::Postgres(conn) => Ok(conn.ping().await?),
        }
    }

    /// The byte-string column type for this back-end
    pub fn bytes_type(&self) -> &'static str {
        match self {
            DbClient::Sqlite(_) => "BLOB",
            DbClient::Postgres(_) => "BYTEA",
        }
    }
}
