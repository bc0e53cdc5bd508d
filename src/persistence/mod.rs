//! Persistence layer for querygate.
//!
//! Manages the local SQLite state database that holds the query history
//! ledger and the asynchronous job queue.

mod history;
mod jobs;
mod migrations;

pub use history::{ExecutionRecord, HistoryEntry, HistoryStore, MemoryHistory, SqliteHistory};
pub use jobs::{JobCompletion, JobQueue, JobStatus, NewJob, QueueJob};

use crate::error::{GatewayError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const OPEN_ATTEMPTS: u32 = 3;
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| GatewayError::persistence(format!("Invalid timestamp '{raw}': {e}")))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_id(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| GatewayError::persistence(format!("Invalid id '{raw}': {e}")))
}

/// The local SQLite database holding the history ledger and the job queue.
#[derive(Debug, Clone)]
pub struct StateDb {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl StateDb {
    /// Opens the database at `path`, creating it and its directory if needed.
    ///
    /// A file that is not a usable database is renamed to `*.db.bak` and
    /// replaced with a fresh one.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                GatewayError::persistence(format!("Cannot create {}: {e}", dir.display()))
            })?;
        }

        match Self::open_with_retries(path).await {
            Ok(db) => Ok(db),
            Err(e) if path.exists() => {
                let backup = path.with_extension("db.bak");
                warn!(error = %e, backup = %backup.display(), "State database unusable, starting fresh");
                std::fs::rename(path, &backup).map_err(|e| {
                    GatewayError::persistence(format!("Cannot move {} aside: {e}", path.display()))
                })?;
                Self::open_with_retries(path).await
            }
            Err(e) => Err(e),
        }
    }

    /// A private in-memory database, for tests and one-shot runs.
    pub async fn in_memory() -> Result<Self> {
        // One connection: every new in-memory connection is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to open in-memory database: {e}")))?;
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool, path: None })
    }

    /// Lock contention from another process is retried with growing delays.
    async fn open_with_retries(path: &Path) -> Result<Self> {
        let mut delay = FIRST_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match Self::connect(path).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!(path = %path.display(), "State database ready");
                    return Ok(Self {
                        pool,
                        path: Some(path.to_path_buf()),
                    });
                }
                Err(e) if attempt < OPEN_ATTEMPTS => {
                    debug!(attempt, error = %e, "State database busy, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect(path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to open state database: {e}")))
    }

    /// None for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn history(&self) -> SqliteHistory {
        SqliteHistory::new(self.pool.clone())
    }

    pub fn jobs(&self) -> JobQueue {
        JobQueue::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
