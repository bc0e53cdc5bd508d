//! Query history ledger.
//!
//! One entry per submitted query, appended unexecuted and updated in place
//! exactly once when the query runs.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use uuid::Uuid;

use super::{format_timestamp, parse_id, parse_optional_timestamp, parse_timestamp};
use crate::error::{GatewayError, Result};
use crate::safety::{Classification, OperationKind, RiskLevel};

/// A query history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub question: String,
    pub sql: String,
    pub kind: OperationKind,
    pub risk: RiskLevel,
    pub actor: Option<String>,
    pub executed: bool,
    /// `None` until the query has run.
    pub success: Option<bool>,
    pub rows_affected: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    /// Creates an unexecuted entry stamped with the current time.
    pub fn new(
        id: Uuid,
        question: impl Into<String>,
        sql: impl Into<String>,
        classification: Classification,
        actor: Option<String>,
    ) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            question: question.into(),
            sql: sql.into(),
            kind: classification.kind,
            risk: classification.risk,
            actor,
            executed: false,
            success: None,
            rows_affected: None,
            elapsed_ms: None,
            error: None,
            executed_at: None,
        }
    }

    fn apply(&mut self, record: &ExecutionRecord) {
        self.executed = true;
        self.success = Some(record.success);
        self.rows_affected = record.rows_affected;
        self.elapsed_ms = Some(record.elapsed_ms);
        self.error = record.error.clone();
        self.executed_at = Some(Utc::now());
    }
}

/// Outcome written onto a history entry when its query runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub success: bool,
    pub rows_affected: Option<u64>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// Append/update ledger of processed queries.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: &HistoryEntry) -> Result<()>;

    /// Marks an unexecuted entry as executed. Fails with `NotFound` if the
    /// entry is unknown or was already marked.
    async fn mark_executed(&self, id: Uuid, record: &ExecutionRecord) -> Result<()>;

    /// Most recent entries first, at most `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>>;

    async fn get(&self, id: Uuid) -> Result<Option<HistoryEntry>>;
}

fn already_executed(id: Uuid) -> GatewayError {
    GatewayError::not_found(format!("history entry {id} is unknown or already executed"))
}

/// Process-local history, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<HistoryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| GatewayError::internal("history lock poisoned"))
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        self.lock()?.push(entry.clone());
        Ok(())
    }

    async fn mark_executed(&self, id: Uuid, record: &ExecutionRecord) -> Result<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id && !e.executed)
            .ok_or_else(|| already_executed(id))?;
        entry.apply(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        Ok(self.lock()?.iter().rev().take(limit).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<HistoryEntry>> {
        Ok(self.lock()?.iter().find(|e| e.id == id).cloned())
    }
}

/// Raw database row for a history entry.
#[derive(Debug, Clone, FromRow)]
struct HistoryEntryRow {
    id: String,
    question: String,
    sql: String,
    operation_kind: String,
    risk_level: String,
    actor: Option<String>,
    executed: bool,
    success: Option<bool>,
    rows_affected: Option<i64>,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    created_at: String,
    executed_at: Option<String>,
}

impl TryFrom<HistoryEntryRow> for HistoryEntry {
    type Error = GatewayError;

    fn try_from(row: HistoryEntryRow) -> Result<Self> {
        Ok(Self {
            id: parse_id(&row.id)?,
            created_at: parse_timestamp(&row.created_at)?,
            question: row.question,
            sql: row.sql,
            kind: row.operation_kind.parse()?,
            risk: row.risk_level.parse()?,
            actor: row.actor,
            executed: row.executed,
            success: row.success,
            rows_affected: row.rows_affected.map(|n| n.max(0) as u64),
            elapsed_ms: row.execution_time_ms.map(|n| n.max(0) as u64),
            error: row.error_message,
            executed_at: parse_optional_timestamp(row.executed_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, question, sql, operation_kind, risk_level, actor, executed, success,
           rows_affected, execution_time_ms, error_message, created_at, executed_at
    FROM query_history
"#;

/// History persisted in the state database.
#[derive(Debug, Clone)]
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Total number of recorded entries.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM query_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn append(&self, entry: &HistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO query_history
            (id, question, sql, operation_kind, risk_level, actor, executed, success,
             rows_affected, execution_time_ms, error_message, created_at, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.question)
        .bind(&entry.sql)
        .bind(entry.kind.as_str())
        .bind(entry.risk.as_str())
        .bind(&entry.actor)
        .bind(entry.executed)
        .bind(entry.success)
        .bind(entry.rows_affected.map(|n| n as i64))
        .bind(entry.elapsed_ms.map(|n| n as i64))
        .bind(&entry.error)
        .bind(format_timestamp(&entry.created_at))
        .bind(entry.executed_at.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to record history: {e}")))?;

        Ok(())
    }

    async fn mark_executed(&self, id: Uuid, record: &ExecutionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE query_history
            SET executed = 1, success = ?, rows_affected = ?, execution_time_ms = ?,
                error_message = ?, executed_at = ?
            WHERE id = ? AND executed = 0
            "#,
        )
        .bind(record.success)
        .bind(record.rows_affected.map(|n| n as i64))
        .bind(record.elapsed_ms as i64)
        .bind(&record.error)
        .bind(format_timestamp(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to update history: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(already_executed(id));
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC LIMIT ?");
        let rows: Vec<HistoryEntryRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to list history: {e}")))?;

        rows.into_iter().map(HistoryEntry::try_from).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<HistoryEntry>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row: Option<HistoryEntryRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to get history entry: {e}")))?;

        row.map(HistoryEntry::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StateDb;
    use pretty_assertions::assert_eq;

    fn entry(question: &str) -> HistoryEntry {
        HistoryEntry::new(
            Uuid::new_v4(),
            question,
            "SELECT COUNT(*) FROM companies",
            Classification::new(OperationKind::Read, RiskLevel::Low),
            Some("alice".to_string()),
        )
    }

    fn success(rows: u64) -> ExecutionRecord {
        ExecutionRecord {
            success: true,
            rows_affected: Some(rows),
            elapsed_ms: 12,
            error: None,
        }
    }

    async fn stores() -> Vec<Box<dyn HistoryStore>> {
        let db = StateDb::in_memory().await.unwrap();
        vec![Box::new(MemoryHistory::new()), Box::new(db.history())]
    }

    #[tokio::test]
    async fn test_append_and_get() {
        for store in stores().await {
            let e = entry("How many companies?");
            store.append(&e).await.unwrap();

            let loaded = store.get(e.id).await.unwrap().unwrap();
            assert_eq!(loaded.question, "How many companies?");
            assert_eq!(loaded.kind, OperationKind::Read);
            assert!(!loaded.executed);
            assert_eq!(loaded.success, None);
        }
    }

    #[tokio::test]
    async fn test_mark_executed_updates_in_place() {
        for store in stores().await {
            let e = entry("q");
            store.append(&e).await.unwrap();
            store.mark_executed(e.id, &success(3)).await.unwrap();

            let all = store.recent(10).await.unwrap();
            assert_eq!(all.len(), 1);
            assert!(all[0].executed);
            assert_eq!(all[0].success, Some(true));
            assert_eq!(all[0].rows_affected, Some(3));
            assert_eq!(all[0].elapsed_ms, Some(12));
            assert!(all[0].executed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_mark_executed_twice_is_not_found() {
        for store in stores().await {
            let e = entry("q");
            store.append(&e).await.unwrap();
            store.mark_executed(e.id, &success(1)).await.unwrap();

            let err = store.mark_executed(e.id, &success(1)).await.unwrap_err();
            assert!(matches!(err, GatewayError::NotFound(_)));

            let err = store
                .mark_executed(Uuid::new_v4(), &success(1))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_recent_is_most_recent_first_and_bounded() {
        for store in stores().await {
            for i in 0..5 {
                store.append(&entry(&format!("q{i}"))).await.unwrap();
            }

            let recent = store.recent(3).await.unwrap();
            let questions: Vec<&str> = recent.iter().map(|e| e.question.as_str()).collect();
            assert_eq!(questions, vec!["q4", "q3", "q2"]);
        }
    }

    #[tokio::test]
    async fn test_failed_execution_keeps_error() {
        let db = StateDb::in_memory().await.unwrap();
        let store = db.history();
        let e = entry("q");
        store.append(&e).await.unwrap();
        store
            .mark_executed(
                e.id,
                &ExecutionRecord {
                    success: false,
                    rows_affected: None,
                    elapsed_ms: 4,
                    error: Some("relation \"x\" does not exist".to_string()),
                },
            )
            .await
            .unwrap();

        let loaded = store.get(e.id).await.unwrap().unwrap();
        assert_eq!(loaded.success, Some(false));
        assert_eq!(loaded.error.as_deref(), Some("relation \"x\" does not exist"));
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
