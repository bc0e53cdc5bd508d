//! Shared fixtures for integration tests.

use std::sync::Arc;

use querygate::db::{Column, ColumnInfo, ExecutionGateway, MockDatabaseClient, QueryResult, Schema, Table, Value};
use querygate::llm::{LlmGenerator, MockLlmClient, SqlGenerator};
use querygate::persistence::StateDb;
use querygate::pipeline::{Pipeline, PipelineOptions};
use tempfile::TempDir;

/// A pipeline wired to a mock database and a file-backed state database.
pub struct Fixture {
    pub pipeline: Arc<Pipeline>,
    pub db: Arc<MockDatabaseClient>,
    pub state: StateDb,
    _dir: TempDir,
}

impl Fixture {
    pub async fn new(generator: Arc<dyn SqlGenerator>, db: MockDatabaseClient) -> Self {
        Self::with_options(generator, db, PipelineOptions::default()).await
    }

    pub async fn with_options(
        generator: Arc<dyn SqlGenerator>,
        db: MockDatabaseClient,
        options: PipelineOptions,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDb::open(&dir.path().join("state.db")).await.unwrap();
        let db = Arc::new(db);
        let pipeline = Pipeline::new(
            generator,
            ExecutionGateway::new(db.clone()),
            Arc::new(state.history()),
            options,
        );
        Self {
            pipeline: Arc::new(pipeline),
            db,
            state,
            _dir: dir,
        }
    }
}

/// A model-backed generator that answers `question` with `sql`.
pub fn answering(question: &str, sql: &str) -> Arc<dyn SqlGenerator> {
    let client = MockLlmClient::new().with_response(question, format!("```sql\n{}\n```", sql));
    Arc::new(LlmGenerator::new(Arc::new(client)))
}

/// A one-row, one-column COUNT result.
pub fn count_result(n: i64) -> QueryResult {
    QueryResult::with_data(
        vec![ColumnInfo::new("count", "bigint")],
        vec![vec![Value::Int(n)]],
    )
}

pub fn companies_schema() -> Schema {
    let mut companies = Table::new("companies");
    companies.columns = vec![
        Column::new("id", "integer").primary(),
        Column::new("name", "text"),
        Column::new("created_at", "timestamp with time zone"),
    ];

    let mut schema = Schema::new();
    schema.tables.push(companies);
    schema
}
