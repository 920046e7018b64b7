//! Transactional store adapter over `SQLite`.
//!
//! Two transaction modes with different locking contracts:
//!
//! - [`TxMode::Optimistic`] (`BEGIN DEFERRED`): no lock is taken until the
//!   first write. Two read-then-write transactions can both hold a shared
//!   read lock and then race to upgrade; the loser fails with `SQLITE_BUSY`
//!   instead of waiting. Only blind single-statement writes may use it.
//! - [`TxMode::Reserving`] (`BEGIN IMMEDIATE`): the write reservation is taken
//!   when the transaction starts, so reserving transactions queue behind each
//!   other (bounded by the busy timeout) and never hit the upgrade race. Every
//!   lock, dispatch and completion path uses this mode.

use std::{path::Path, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    pool::PoolConnection,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
    },
    Row, Sqlite, SqliteConnection, SqlitePool,
};

use crate::{config::StoreConfig, Error, Result};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Database schema as SQL string - executed once on open
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY CHECK(version = 1)
);

CREATE TABLE IF NOT EXISTS tickets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL CHECK(priority BETWEEN 0 AND 4),
    status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open', 'completed')),
    error_type TEXT NOT NULL,
    message TEXT NOT NULL,
    source TEXT NOT NULL,
    stack_trace TEXT,
    file_context TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    locked_by TEXT,
    locked_at INTEGER,
    lease_expires INTEGER,
    completion_notes TEXT,
    test_steps TEXT,
    test_results TEXT,
    completed_at INTEGER,
    completion_metadata TEXT,
    deleted INTEGER NOT NULL DEFAULT 0 CHECK(deleted IN (0, 1)),
    CHECK(
        (locked_by IS NULL AND locked_at IS NULL AND lease_expires IS NULL)
        OR (locked_by IS NOT NULL AND locked_at IS NOT NULL AND lease_expires > locked_at)
    ),
    CHECK(status = 'open' OR locked_by IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_tickets_dispatch
    ON tickets(status, deleted, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tickets_lease ON tickets(lease_expires);
";

/// Locking contract of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Lock lazily on first write
    Optimistic,
    /// Reserve the write lock at `BEGIN`
    Reserving,
}

impl TxMode {
    const fn begin_sql(self) -> &'static str {
        match self {
            Self::Optimistic => "BEGIN DEFERRED",
            Self::Reserving => "BEGIN IMMEDIATE",
        }
    }
}

/// Handle on the shared ticket database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database at the configured path.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.resolved_path()?;
        Self::open_path(&path, config).await
    }

    /// Open a file-backed store in WAL mode.
    pub async fn open_path(path: &Path, config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Io(format!(
                        "Failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(busy_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::Database(format!(
                    "Failed to open ticket database {}: {e}",
                    path.display()
                ))
            })?;

        Self::from_pool(pool).await
    }

    /// A private in-memory store. It pins a single connection, so the
    /// database lives exactly as long as the pool.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        init_schema(&pool).await?;
        check_schema_version(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, for plain autocommit reads.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction in the given mode.
    ///
    /// A reserving `BEGIN` waits up to the busy timeout for another writer
    /// and then fails with a transient [`Error::Contention`].
    pub async fn begin(&self, mode: TxMode) -> Result<StoreTx> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(mode.begin_sql()).execute(&mut *conn).await?;
        Ok(StoreTx {
            conn: Some(conn),
            mode,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// An open transaction owning one pooled connection.
///
/// Finish it with [`StoreTx::finish`]. A transaction dropped unfinished
/// (cancelled task, panic) is rolled back before its connection is reused.
pub struct StoreTx {
    conn: Option<PoolConnection<Sqlite>>,
    mode: TxMode,
}

impl std::fmt::Debug for StoreTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTx")
            .field("mode", &self.mode)
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl StoreTx {
    #[must_use]
    pub const fn mode(&self) -> TxMode {
        self.mode
    }

    /// Connection to run statements on inside the transaction.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::Database("Transaction already finished".into()))
    }

    /// Commit if `result` is `Ok`, roll back otherwise, and hand `result`
    /// back. A failed commit is rolled back and reported instead.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let Some(mut conn) = self.conn.take() else {
            return Err(Error::Database("Transaction already finished".into()));
        };

        match result {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(value),
                Err(commit_err) => {
                    rollback_or_discard(conn).await;
                    Err(commit_err.into())
                }
            },
            Err(err) => {
                rollback_or_discard(conn).await;
                Err(err)
            }
        }
    }
}

impl Drop for StoreTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => drop(handle.spawn(rollback_or_discard(conn))),
                Err(_) => drop(conn.detach()),
            }
        }
    }
}

/// Roll back; if even that fails, close the connection rather than return a
/// connection with an open transaction to the pool.
async fn rollback_or_discard(mut conn: PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(error = %e, "rollback failed; discarding connection");
        drop(conn.detach());
    }
}

/// Initialize database schema
async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to initialize schema: {e}")))?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(CURRENT_SCHEMA_VERSION)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set schema version: {e}")))?;

    Ok(())
}

/// Check database schema version matches expected
async fn check_schema_version(pool: &SqlitePool) -> Result<()> {
    let version: Option<i64> = sqlx::query("SELECT version FROM schema_version")
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get("version"))
        .transpose()?;

    match version {
        Some(v) if v == CURRENT_SCHEMA_VERSION => Ok(()),
        Some(v) => Err(Error::Database(format!(
            "Schema version mismatch: database has version {v}, expected {CURRENT_SCHEMA_VERSION}"
        ))),
        None => Err(Error::Database("Schema version row is missing".into())),
    }
}

/// Timestamps are stored as epoch milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Parse(format!("Timestamp out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count_rows(store: &Store) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_version")
            .fetch_one(store.pool())
            .await?;
        Ok(count.0)
    }

    #[tokio::test]
    async fn test_open_in_memory_initializes_schema() -> Result<()> {
        let store = Store::open_in_memory().await?;
        assert_eq!(count_rows(&store).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_finish_ok_commits() -> Result<()> {
        let store = Store::open_in_memory().await?;
        let mut tx = store.begin(TxMode::Reserving).await?;
        let result = sqlx::query("DELETE FROM schema_version")
            .execute(tx.conn()?)
            .await
            .map(|_| ())
            .map_err(Error::from);
        tx.finish(result).await?;

        assert_eq!(count_rows(&store).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_finish_err_rolls_back_and_propagates() -> Result<()> {
        let store = Store::open_in_memory().await?;
        let mut tx = store.begin(TxMode::Reserving).await?;
        sqlx::query("DELETE FROM schema_version")
            .execute(tx.conn()?)
            .await?;

        let outcome: Result<()> = tx
            .finish(Err(Error::Database("simulated failure".into())))
            .await;

        assert_eq!(outcome, Err(Error::Database("simulated failure".into())));
        assert_eq!(count_rows(&store).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() -> Result<()> {
        let store = Store::open_in_memory().await?;
        {
            let mut tx = store.begin(TxMode::Optimistic).await?;
            sqlx::query("DELETE FROM schema_version")
                .execute(tx.conn()?)
                .await?;
        }

        // The rollback runs on a spawned task; the single pooled connection
        // is handed back only once it has finished.
        assert_eq!(count_rows(&store).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reserving_begin_times_out_as_contention() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = StoreConfig {
            path: None,
            busy_timeout_ms: 50,
            max_connections: 2,
        };
        let store = Store::open_path(&dir.path().join("busy.db"), &config).await?;

        let holder = store.begin(TxMode::Reserving).await?;
        let second = store.begin(TxMode::Reserving).await;
        assert!(
            matches!(second, Err(ref e) if e.is_transient()),
            "expected transient contention, got {second:?}"
        );

        holder.finish(Ok(())).await?;
        let third = store.begin(TxMode::Reserving).await?;
        third.finish(Ok(())).await
    }

    #[test]
    fn test_millis_round_trip() -> Result<()> {
        let at = from_millis(1_700_000_000_123)?;
        assert_eq!(to_millis(at), 1_700_000_000_123);
        Ok(())
    }
}
