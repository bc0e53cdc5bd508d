//! End-to-end tests of the job queue path.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use querygate::db::MockDatabaseClient;
use querygate::llm::PatternGenerator;
use querygate::persistence::{HistoryStore, JobStatus, NewJob};
use querygate::pipeline::PipelineOptions;
use querygate::safety::{OperationKind, RiskLevel};
use querygate::worker::{BatchSummary, JobDrainer, LogNotifier};

use super::common::{answering, companies_schema, count_result, Fixture};

const ARCHIVE_SQL: &str = "UPDATE documents SET archived = true WHERE id = 9";

fn drainer(fixture: &Fixture) -> JobDrainer {
    JobDrainer::new(
        fixture.pipeline.clone(),
        fixture.state.jobs(),
        Arc::new(LogNotifier),
    )
}

#[tokio::test]
async fn test_production_write_is_blocked_before_the_gateway() {
    let fixture = Fixture::new(answering("archive", ARCHIVE_SQL), MockDatabaseClient::new()).await;
    let queue = fixture.state.jobs();

    let id = queue
        .enqueue(&NewJob::new("archive document 9").with_environment("prod"))
        .await
        .unwrap();
    let summary = drainer(&fixture).drain_once().await.unwrap();
    assert_eq!(
        summary,
        BatchSummary {
            claimed: 1,
            completed: 0,
            blocked: 1,
            failed: 0,
        }
    );

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Blocked);
    assert_eq!(job.sql.as_deref(), Some(ARCHIVE_SQL));
    assert_eq!(job.kind, Some(OperationKind::WriteSafe));
    assert_eq!(job.risk, Some(RiskLevel::Medium));
    assert_eq!(job.execution_allowed, Some(false));
    assert_eq!(job.error_kind.as_deref(), Some("environment_restriction"));
    assert!(job.error.as_deref().unwrap().starts_with("Blocked by policy: WRITE_SAFE"));
    assert!(job
        .response
        .as_deref()
        .unwrap()
        .contains("not allowed in production"));
    assert!(job.executed_at.is_none());
    assert!(fixture.db.executed().is_empty());

    // Blocked statements never reach the ledger.
    assert!(fixture.state.history().get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_same_write_runs_outside_production() {
    let fixture = Fixture::new(answering("archive", ARCHIVE_SQL), MockDatabaseClient::new()).await;
    let queue = fixture.state.jobs();

    let id = queue
        .enqueue(&NewJob::new("archive document 9").with_environment("staging"))
        .await
        .unwrap();
    let summary = drainer(&fixture).drain_once().await.unwrap();
    assert_eq!(summary.completed, 1);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.execution_allowed, Some(true));
    assert!(job.results.is_none());
    assert!(job.executed_at.is_some());
    assert!(job
        .response
        .as_deref()
        .unwrap()
        .starts_with("Operation completed successfully."));

    let executed = fixture.db.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].transactional);

    let entry = fixture.state.history().get(id).await.unwrap().unwrap();
    assert!(entry.executed);
    assert_eq!(entry.success, Some(true));
}

#[tokio::test]
async fn test_staging_drop_blocked_while_admin_disabled() {
    let fixture = Fixture::new(
        answering("drop the scratch table", "DROP TABLE staging_tmp"),
        MockDatabaseClient::new(),
    )
    .await;
    let queue = fixture.state.jobs();

    let id = queue
        .enqueue(&NewJob::new("drop the scratch table").with_environment("staging"))
        .await
        .unwrap();
    let summary = drainer(&fixture).drain_once().await.unwrap();
    assert_eq!(summary.blocked, 1);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Blocked);
    assert_eq!(job.kind, Some(OperationKind::Admin));
    assert_eq!(job.error_kind.as_deref(), Some("operation_disabled"));
    assert_eq!(
        job.error.as_deref(),
        Some("Operation disabled: Administrative operations are disabled")
    );
    let response = job.response.as_deref().unwrap();
    assert!(response.starts_with("Administrative operations"));
    assert!(!response.contains("production"));
    assert!(fixture.db.executed().is_empty());
}

#[tokio::test]
async fn test_staging_drop_runs_with_admin_enabled() {
    let options = PipelineOptions {
        enable_admin_operations: true,
        ..PipelineOptions::default()
    };
    let fixture = Fixture::with_options(
        answering("drop the scratch table", "DROP TABLE staging_tmp"),
        MockDatabaseClient::new(),
        options,
    )
    .await;
    let queue = fixture.state.jobs();

    let id = queue
        .enqueue(&NewJob::new("drop the scratch table").with_environment("staging"))
        .await
        .unwrap();
    drainer(&fixture).drain_once().await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.response.as_deref(),
        Some("Administrative operation completed successfully.")
    );
    assert_eq!(fixture.db.executed().len(), 1);
}

#[tokio::test]
async fn test_production_read_runs() {
    let fixture = Fixture::new(
        answering("how many companies", "SELECT COUNT(*) AS count FROM companies"),
        MockDatabaseClient::new().with_result("count(*)", count_result(3)),
    )
    .await;
    let queue = fixture.state.jobs();

    let id = queue
        .enqueue(&NewJob::new("How many companies are there?").with_environment("prod"))
        .await
        .unwrap();
    drainer(&fixture).drain_once().await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.response.as_deref(), Some("Found 3 results."));
    assert_eq!(job.results, Some(serde_json::json!([{ "count": 3 }])));
    assert_eq!(job.rows_affected, Some(1));
}

#[tokio::test]
async fn test_hebrew_job_with_schema_snapshot() {
    let generator = PatternGenerator::new().with_alias("חברות", "companies");
    let fixture = Fixture::new(
        Arc::new(generator),
        MockDatabaseClient::new().with_result("count(*)", count_result(12)),
    )
    .await;
    let queue = fixture.state.jobs();

    let snapshot = serde_json::to_value(companies_schema()).unwrap();
    let id = queue
        .enqueue(
            &NewJob::new("כמה חברות יש?")
                .with_language("he")
                .with_environment("prod")
                .with_schema(snapshot),
        )
        .await
        .unwrap();
    drainer(&fixture).drain_once().await.unwrap();

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.sql.as_deref(),
        Some("SELECT COUNT(*) AS count FROM companies")
    );
    assert_eq!(job.response.as_deref(), Some("נמצאו 12 תוצאות."));
}

#[tokio::test]
async fn test_batches_take_oldest_jobs_first() {
    let fixture = Fixture::new(
        answering("count", "SELECT COUNT(*) AS count FROM companies"),
        MockDatabaseClient::new().with_result("count(*)", count_result(1)),
    )
    .await;
    let queue = fixture.state.jobs();

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = queue
            .enqueue(&NewJob::new(format!("count companies #{n}")))
            .await
            .unwrap();
        ids.push(id);
    }

    let drainer = drainer(&fixture).with_batch_size(2);
    let first = drainer.drain_once().await.unwrap();
    assert_eq!(first.claimed, 2);

    let status = |id| {
        let queue = queue.clone();
        async move { queue.get(id).await.unwrap().unwrap().status }
    };
    assert_eq!(status(ids[0]).await, JobStatus::Completed);
    assert_eq!(status(ids[1]).await, JobStatus::Completed);
    assert_eq!(status(ids[2]).await, JobStatus::Pending);

    let second = drainer.drain_once().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(status(ids[2]).await, JobStatus::Completed);

    assert_eq!(drainer.drain_once().await.unwrap(), BatchSummary::default());
    assert_eq!(fixture.db.count_matching("count(*)"), 3);
}
