//! End-to-end tests of the synchronous path.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use querygate::db::{MockDatabaseClient, QueryResult};
use querygate::error::GatewayError;
use querygate::llm::PatternGenerator;
use querygate::persistence::HistoryStore;
use querygate::pipeline::{LifecycleState, SubmitRequest};
use querygate::safety::{OperationKind, RiskLevel};

use super::common::{answering, companies_schema, count_result, Fixture};

#[tokio::test]
async fn test_count_question_end_to_end() {
    let fixture = Fixture::new(
        answering(
            "how many companies",
            "SELECT COUNT(*) AS count FROM Companies",
        ),
        MockDatabaseClient::new().with_result("count(*)", count_result(42)),
    )
    .await;

    let submission = fixture
        .pipeline
        .submit(SubmitRequest::new("How many companies are in the system?").execute_immediately())
        .await
        .unwrap();

    assert_eq!(submission.query.kind, OperationKind::Read);
    assert_eq!(submission.query.risk, RiskLevel::Low);
    assert!(!submission.query.requires_confirmation);

    let outcome = submission.outcome.expect("read should run in-line");
    assert!(outcome.success);
    assert_eq!(outcome.rows_affected, Some(1));
    let rows = outcome.rows.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["count"], serde_json::json!(42));

    let executed = fixture.db.executed();
    assert_eq!(executed.len(), 1);
    assert!(!executed[0].transactional);
}

#[tokio::test]
async fn test_count_question_with_pattern_generator() {
    let fixture = Fixture::new(
        Arc::new(PatternGenerator::new()),
        MockDatabaseClient::new()
            .with_schema(companies_schema())
            .with_result("count(*)", count_result(7)),
    )
    .await;

    let submission = fixture
        .pipeline
        .submit(SubmitRequest::new("How many companies are in the system?").execute_immediately())
        .await
        .unwrap();

    assert_eq!(submission.method, "pattern_matching");
    assert_eq!(
        submission.query.sql,
        "SELECT COUNT(*) AS count FROM companies"
    );
    assert!(submission.outcome.unwrap().success);
}

#[tokio::test]
async fn test_unfiltered_delete_end_to_end() {
    let fixture = Fixture::new(
        answering("documents", "DELETE FROM Documents"),
        MockDatabaseClient::new().with_result("delete from documents", QueryResult::affected(12)),
    )
    .await;

    let submission = fixture
        .pipeline
        .submit(SubmitRequest::new("DELETE FROM Documents").execute_immediately())
        .await
        .unwrap();
    let query = submission.query;

    assert_eq!(query.kind, OperationKind::WriteRisky);
    assert_eq!(query.risk, RiskLevel::Critical);
    assert!(query.requires_confirmation);
    assert!(submission.outcome.is_none());
    assert!(query
        .warnings
        .contains(&"WARNING: No WHERE clause - will affect ALL rows!".to_string()));

    let err = fixture.pipeline.execute(query.id, false).await.unwrap_err();
    assert!(matches!(err, GatewayError::ConfirmationRequired(_)));
    assert!(fixture.db.executed().is_empty());

    let outcome = fixture.pipeline.execute(query.id, true).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.rows_affected, Some(12));
    assert!(outcome.rows.is_none());
    assert!(!outcome.can_rollback);

    let executed = fixture.db.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].transactional);
}

#[tokio::test]
async fn test_execute_is_idempotent() {
    let fixture = Fixture::new(
        answering("archive", "UPDATE documents SET archived = true WHERE id = 9"),
        MockDatabaseClient::new(),
    )
    .await;
    let id = fixture
        .pipeline
        .submit(SubmitRequest::new("archive document 9"))
        .await
        .unwrap()
        .query
        .id;

    assert!(fixture.pipeline.execute(id, true).await.unwrap().success);
    let second = fixture.pipeline.execute(id, true).await;
    assert!(matches!(second, Err(GatewayError::NotFound(_))));
    assert_eq!(fixture.db.count_matching("update documents"), 1);
}

#[tokio::test]
async fn test_concurrent_execute_runs_once() {
    let fixture = Fixture::new(
        answering("archive", "UPDATE documents SET archived = true WHERE id = 9"),
        MockDatabaseClient::new(),
    )
    .await;
    let id = fixture
        .pipeline
        .submit(SubmitRequest::new("archive document 9"))
        .await
        .unwrap()
        .query
        .id;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = fixture.pipeline.clone();
            tokio::spawn(async move { pipeline.execute(id, true).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(fixture.db.count_matching("update documents"), 1);
}

#[tokio::test]
async fn test_history_entry_updated_in_place() {
    let fixture = Fixture::new(
        answering("archive", "DELETE FROM documents WHERE id = 5"),
        MockDatabaseClient::new().with_result("delete from documents", QueryResult::affected(1)),
    )
    .await;
    let history = fixture.state.history();

    let id = fixture
        .pipeline
        .submit(SubmitRequest::new("archive document 5").with_actor("dana"))
        .await
        .unwrap()
        .query
        .id;

    let entries = fixture.pipeline.history(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert!(!entries[0].executed);
    assert_eq!(entries[0].success, None);
    assert_eq!(entries[0].actor.as_deref(), Some("dana"));

    fixture.pipeline.confirm(id, true).await.unwrap().unwrap();

    assert_eq!(history.count().await.unwrap(), 1);
    let entry = history.get(id).await.unwrap().unwrap();
    assert!(entry.executed);
    assert_eq!(entry.success, Some(true));
    assert_eq!(entry.rows_affected, Some(1));
    assert!(entry.executed_at.is_some());
}

#[tokio::test]
async fn test_cancelled_query_never_runs() {
    let fixture = Fixture::new(
        answering("truncate", "TRUNCATE audit_log"),
        MockDatabaseClient::new(),
    )
    .await;
    let submission = fixture
        .pipeline
        .submit(SubmitRequest::new("truncate the audit log"))
        .await
        .unwrap();
    assert_eq!(submission.query.kind, OperationKind::WriteRisky);
    assert_eq!(submission.query.risk, RiskLevel::High);

    let id = submission.query.id;
    fixture.pipeline.cancel(id).unwrap();
    assert_eq!(
        fixture.pipeline.get(id).unwrap().unwrap().state,
        LifecycleState::Cancelled
    );
    assert!(matches!(
        fixture.pipeline.execute(id, true).await,
        Err(GatewayError::NotFound(_))
    ));
    assert!(fixture.db.executed().is_empty());

    let entry = fixture.state.history().get(id).await.unwrap().unwrap();
    assert!(!entry.executed);
}

#[tokio::test]
async fn test_generation_failure_is_returned() {
    let fixture = Fixture::new(
        Arc::new(PatternGenerator::new()),
        MockDatabaseClient::new().with_schema(companies_schema()),
    )
    .await;

    let err = fixture
        .pipeline
        .submit(SubmitRequest::new("tell me a joke"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Generation(_)));
    assert!(fixture.pipeline.history(10).await.unwrap().is_empty());
}
