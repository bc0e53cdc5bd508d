//! Execution gateway.
//!
//! Routes a classified statement to the database: reads run directly, every
//! other kind runs inside a committed transaction. Also builds the
//! non-mutating "would affect" preview for UPDATE and DELETE.

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use tracing::{debug, info};

use super::{DatabaseClient, QueryResult, Value};
use crate::error::{GatewayError, Result};
use crate::safety::{strip_comments, OperationKind};

/// Number of sample rows fetched by a preview.
pub const PREVIEW_SAMPLE_LIMIT: usize = 10;

static DELETE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*DELETE\s+FROM\s+(.+)$").unwrap());

static UPDATE_TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*UPDATE\s+(?:ONLY\s+)?("[^"]+"|[\w.]+)(\s+(?:AS\s+)?\w+)?\s+SET\b"#)
        .unwrap()
});

static WHERE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").unwrap());

static RETURNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\s+RETURNING\b.*$").unwrap());

/// Outcome of a gateway run: the database result plus wall-clock timing.
#[derive(Debug, Clone)]
pub struct GatewayRun {
    pub result: QueryResult,
    pub elapsed_ms: u64,
}

/// Rows a write would touch, measured without mutating anything.
#[derive(Debug, Clone)]
pub struct ImpactPreview {
    pub affected_rows: u64,
    pub sample: QueryResult,
}

/// Wraps the database collaborator with kind-based routing.
#[derive(Clone)]
pub struct ExecutionGateway {
    db: Arc<dyn DatabaseClient>,
}

impl ExecutionGateway {
    pub fn new(db: Arc<dyn DatabaseClient>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<dyn DatabaseClient> {
        &self.db
    }

    /// Executes a statement according to its operation kind.
    ///
    /// No retry: a failure is reported as-is and the transaction (if any)
    /// has already been rolled back by the client.
    pub async fn run(&self, kind: OperationKind, sql: &str) -> Result<GatewayRun> {
        let start = Instant::now();

        let result = if kind.is_read() {
            self.db.execute_query(sql).await?
        } else {
            self.db.execute_in_transaction(sql).await?
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            kind = %kind,
            elapsed_ms,
            rows = result.effective_row_count(),
            "Statement executed"
        );

        Ok(GatewayRun { result, elapsed_ms })
    }

    /// Counts and samples the rows an UPDATE or DELETE would touch.
    pub async fn preview(&self, sql: &str) -> Result<ImpactPreview> {
        let target = preview_target(sql).ok_or_else(|| {
            GatewayError::validation("Preview is only available for UPDATE and DELETE statements")
        })?;

        let count_sql = format!("SELECT COUNT(*) AS affected FROM {}", target);
        let sample_sql = format!("SELECT * FROM {} LIMIT {}", target, PREVIEW_SAMPLE_LIMIT);
        debug!(%count_sql, "Running preview");

        let counted = self.db.execute_query(&count_sql).await?;
        let affected_rows = counted
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as u64;

        let sample = self.db.execute_query(&sample_sql).await?;

        Ok(ImpactPreview {
            affected_rows,
            sample,
        })
    }
}

/// Rewrites an UPDATE/DELETE into the `table [WHERE ...]` tail of an
/// equivalent SELECT. Returns `None` for anything else.
pub(crate) fn preview_target(sql: &str) -> Option<String> {
    let text = strip_comments(sql);
    let text = text.trim().trim_end_matches(';').trim();

    let target = if let Some(caps) = DELETE_TARGET_RE.captures(text) {
        caps.get(1)?.as_str().to_string()
    } else if let Some(caps) = UPDATE_TARGET_RE.captures(text) {
        let table = caps.get(1)?.as_str();
        let alias = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let rest = &text[caps.get(0)?.end()..];
        match WHERE_RE.find(rest) {
            Some(m) => format!("{}{} {}", table, alias, &rest[m.start()..]),
            None => format!("{}{}", table, alias),
        }
    } else {
        return None;
    };

    Some(RETURNING_RE.replace(target.trim(), "").into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnInfo, MockDatabaseClient};

    fn count_result(n: i64) -> QueryResult {
        QueryResult::with_data(
            vec![ColumnInfo::new("affected", "int8")],
            vec![vec![Value::Int(n)]],
        )
    }

    #[test]
    fn test_preview_target_delete() {
        assert_eq!(
            preview_target("DELETE FROM orders WHERE id = 5;").as_deref(),
            Some("orders WHERE id = 5")
        );
        assert_eq!(preview_target("delete from Documents").as_deref(), Some("Documents"));
        assert_eq!(
            preview_target("DELETE FROM t WHERE a = 1 RETURNING *").as_deref(),
            Some("t WHERE a = 1")
        );
    }

    #[test]
    fn test_preview_target_update() {
        assert_eq!(
            preview_target("UPDATE users SET active = false WHERE last_login < '2020-01-01'")
                .as_deref(),
            Some("users WHERE last_login < '2020-01-01'")
        );
        assert_eq!(
            preview_target("UPDATE users u SET name = 'x' WHERE u.id = 3").as_deref(),
            Some("users u WHERE u.id = 3")
        );
        assert_eq!(
            preview_target("UPDATE users SET active = false").as_deref(),
            Some("users")
        );
    }

    #[test]
    fn test_preview_target_rejects_other_statements() {
        assert!(preview_target("INSERT INTO t VALUES (1)").is_none());
        assert!(preview_target("SELECT * FROM t").is_none());
        assert!(preview_target("DROP TABLE t").is_none());
    }

    #[tokio::test]
    async fn test_run_routes_by_kind() {
        let db = Arc::new(MockDatabaseClient::new());
        let gateway = ExecutionGateway::new(db.clone());

        gateway.run(OperationKind::Read, "SELECT 1").await.unwrap();
        gateway
            .run(OperationKind::WriteSafe, "DELETE FROM t WHERE id = 1")
            .await
            .unwrap();
        gateway
            .run(OperationKind::Admin, "CREATE TABLE x (id int)")
            .await
            .unwrap();

        let transactional: Vec<bool> = db.executed().iter().map(|s| s.transactional).collect();
        assert_eq!(transactional, vec![false, true, true]);
    }

    #[tokio::test]
    async fn test_run_propagates_failure() {
        let db = Arc::new(MockDatabaseClient::new().with_failure("orders", "deadlock detected"));
        let gateway = ExecutionGateway::new(db);

        let err = gateway
            .run(OperationKind::WriteRisky, "DELETE FROM orders")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Execution error: deadlock detected");
    }

    #[tokio::test]
    async fn test_preview_counts_and_samples_without_writing() {
        let db = Arc::new(
            MockDatabaseClient::new().with_result("select count(*)", count_result(150)),
        );
        let gateway = ExecutionGateway::new(db.clone());

        let preview = gateway
            .preview("DELETE FROM orders WHERE status = 'stale'")
            .await
            .unwrap();

        assert_eq!(preview.affected_rows, 150);
        let executed = db.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed.iter().all(|s| !s.transactional));
        assert_eq!(
            executed[1].sql,
            "SELECT * FROM orders WHERE status = 'stale' LIMIT 10"
        );
    }

    #[tokio::test]
    async fn test_preview_rejects_insert() {
        let gateway = ExecutionGateway::new(Arc::new(MockDatabaseClient::new()));
        let err = gateway.preview("INSERT INTO t VALUES (1)").await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
