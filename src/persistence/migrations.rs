//! Forward-only migrations for the state database.
//!
//! Each step runs in its own transaction together with its version row, so
//! a crash mid-migration leaves the database at the previous version.

use crate::error::{GatewayError, Result};
use sqlx::sqlite::SqlitePool;
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "query history",
        statements: &[
            r#"
            CREATE TABLE query_history (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                sql TEXT NOT NULL,
                operation_kind TEXT NOT NULL
                    CHECK (operation_kind IN ('READ', 'WRITE_SAFE', 'WRITE_RISKY', 'ADMIN')),
                risk_level TEXT NOT NULL
                    CHECK (risk_level IN ('low', 'medium', 'high', 'critical')),
                actor TEXT,
                executed INTEGER NOT NULL DEFAULT 0,
                success INTEGER,
                rows_affected INTEGER,
                execution_time_ms INTEGER,
                error_message TEXT,
                created_at TEXT NOT NULL,
                executed_at TEXT
            )
            "#,
            "CREATE INDEX idx_query_history_created ON query_history(created_at)",
        ],
    },
    Migration {
        version: 2,
        name: "job queue",
        statements: &[
            r#"
            CREATE TABLE sql_queue (
                job_id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                schema_info TEXT,
                environment TEXT NOT NULL DEFAULT 'dev',
                language TEXT NOT NULL DEFAULT 'en',
                user_id TEXT,
                conversation_ref TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'blocked')),
                sql_query TEXT,
                query_type TEXT,
                risk_level TEXT,
                execution_allowed INTEGER,
                query_results TEXT,
                rows_affected INTEGER,
                execution_time_ms INTEGER,
                natural_language_response TEXT,
                error_message TEXT,
                error_type TEXT,
                created_at TEXT NOT NULL,
                sql_generated_at TEXT,
                executed_at TEXT,
                completed_at TEXT,
                total_processing_time_ms INTEGER
            )
            "#,
            "CREATE INDEX idx_sql_queue_status_created ON sql_queue(status, created_at)",
        ],
    },
];

fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Brings the database up to the latest version.
///
/// Refuses a database written by a newer build.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| GatewayError::persistence(format!("Failed to create schema_versions: {e}")))?;

    let current = current_version(pool).await?;
    let latest = latest_version();
    if current > latest {
        return Err(GatewayError::persistence(format!(
            "State database is at version {current}, newer than supported version {latest}; \
             upgrade querygate"
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(pool, migration).await?;
        info!(version = migration.version, name = migration.name, "Applied state migration");
    }
    Ok(())
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let failed = |e: sqlx::Error| {
        GatewayError::persistence(format!(
            "Migration {} ({}) failed: {e}",
            migration.version, migration.name
        ))
    };

    let mut tx = pool.begin().await.map_err(failed)?;
    for statement in migration.statements {
        sqlx::query(statement).execute(&mut *tx).await.map_err(failed)?;
    }
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(migration.version)
        .execute(&mut *tx)
        .await
        .map_err(failed)?;
    tx.commit().await.map_err(failed)
}

async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_versions")
        .fetch_one(pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to read schema version: {e}")))?;
    Ok(version.unwrap_or(0))
}
