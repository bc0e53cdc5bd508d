//! Integration tests for the persistence layer.

use std::collections::HashSet;

use chrono::Utc;
use pretty_assertions::assert_eq;
use querygate::persistence::{
    ExecutionRecord, HistoryEntry, HistoryStore, JobCompletion, JobStatus, NewJob, StateDb,
};
use querygate::safety::{Classification, OperationKind, RiskLevel};
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

async fn create_test_db() -> (StateDb, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test_state.db");
    let db = StateDb::open(&path).await.unwrap();
    (db, dir)
}

#[tokio::test]
async fn test_state_db_creation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");

    let db = StateDb::open(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let id = Uuid::new_v4();

    let db = StateDb::open(&path).await.unwrap();
    let entry = HistoryEntry::new(
        id,
        "archive document 9",
        "UPDATE documents SET archived = true WHERE id = 9",
        Classification::new(OperationKind::WriteSafe, RiskLevel::Medium),
        Some("dana".to_string()),
    );
    db.history().append(&entry).await.unwrap();
    db.history()
        .mark_executed(
            id,
            &ExecutionRecord {
                success: true,
                rows_affected: Some(1),
                elapsed_ms: 4,
                error: None,
            },
        )
        .await
        .unwrap();
    db.close().await;

    let db = StateDb::open(&path).await.unwrap();
    let stored = db.history().get(id).await.unwrap().unwrap();
    assert_eq!(stored.question, "archive document 9");
    assert_eq!(stored.kind, OperationKind::WriteSafe);
    assert_eq!(stored.risk, RiskLevel::Medium);
    assert_eq!(stored.actor.as_deref(), Some("dana"));
    assert!(stored.executed);
    assert_eq!(stored.rows_affected, Some(1));
    assert_eq!(stored.elapsed_ms, Some(4));
    db.close().await;
}

#[tokio::test]
async fn test_job_lifecycle_round_trip() {
    let (db, _dir) = create_test_db().await;
    let queue = db.jobs();

    let id = queue
        .enqueue(
            &NewJob::new("How many companies?")
                .with_environment("prod")
                .with_actor("U123")
                .with_conversation_ref("C42"),
        )
        .await
        .unwrap();

    let claimed = queue.claim_batch(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, JobStatus::Processing);

    let classification = Classification::new(OperationKind::Read, RiskLevel::Low);
    let sql = "SELECT COUNT(*) AS count FROM companies";
    queue
        .record_generated(id, sql, classification, Utc::now())
        .await
        .unwrap();

    let mut completion = JobCompletion::new(JobStatus::Completed);
    completion.results = Some(serde_json::json!([{ "count": 5 }]));
    completion.rows_affected = Some(1);
    completion.elapsed_ms = Some(3);
    completion.execution_allowed = Some(true);
    completion.response = Some("Found 5 results.".to_string());
    completion.executed_at = Some(Utc::now());
    assert_ok!(queue.complete(id, &completion).await);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.sql.as_deref(), Some(sql));
    assert_eq!(job.kind, Some(OperationKind::Read));
    assert_eq!(job.risk, Some(RiskLevel::Low));
    assert_eq!(job.results, Some(serde_json::json!([{ "count": 5 }])));
    assert_eq!(job.actor.as_deref(), Some("U123"));
    assert_eq!(job.conversation_ref.as_deref(), Some("C42"));
    assert!(job.sql_generated_at.unwrap() >= job.created_at);
    assert!(job.completed_at.is_some());

    // Terminal jobs cannot be completed again.
    assert_err!(queue.complete(id, &completion).await);
    assert_eq!(queue.count_by_status(JobStatus::Completed).await.unwrap(), 1);
}

#[tokio::test]
async fn test_two_workers_never_claim_the_same_job() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let first = StateDb::open(&path).await.unwrap();
    let second = StateDb::open(&path).await.unwrap();

    for n in 0..20 {
        first
            .jobs()
            .enqueue(&NewJob::new(format!("question {n}")))
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        async {
            let queue = first.jobs();
            let mut ids = Vec::new();
            loop {
                let batch = queue.claim_batch(3).await.unwrap();
                if batch.is_empty() {
                    break ids;
                }
                ids.extend(batch.into_iter().map(|job| job.id));
            }
        },
        async {
            let queue = second.jobs();
            let mut ids = Vec::new();
            loop {
                let batch = queue.claim_batch(3).await.unwrap();
                if batch.is_empty() {
                    break ids;
                }
                ids.extend(batch.into_iter().map(|job| job.id));
            }
        }
    );

    let unique: HashSet<Uuid> = a.iter().chain(b.iter()).copied().collect();
    assert_eq!(a.len() + b.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(
        first.jobs().count_by_status(JobStatus::Pending).await.unwrap(),
        0
    );

    first.close().await;
    second.close().await;
}
