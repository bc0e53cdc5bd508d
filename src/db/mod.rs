//! The target database: the client seam, its PostgreSQL and scripted
//! implementations, and the gateway that routes statements by kind.

mod gateway;
mod mock;
mod postgres;
mod schema;
mod types;

pub use gateway::{ExecutionGateway, GatewayRun, ImpactPreview, PREVIEW_SAMPLE_LIMIT};
pub use mock::{ExecutedStatement, MockDatabaseClient};
pub use postgres::PostgresClient;
pub use schema::{Column, ForeignKey, Schema, Table};
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::config::{ConnectionConfig, ExecutionConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Connects to the configured PostgreSQL database.
pub async fn connect(
    config: &ConnectionConfig,
    limits: &ExecutionConfig,
) -> Result<Arc<dyn DatabaseClient>> {
    let client = PostgresClient::connect(config, limits).await?;
    Ok(Arc::new(client))
}

/// What the gateway and the pipeline need from a database.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Tables, columns and foreign keys of the public schema.
    async fn introspect_schema(&self) -> Result<Schema>;

    /// Runs a statement directly, outside any explicit transaction.
    async fn execute_query(&self, sql: &str) -> Result<QueryResult>;

    /// Runs a statement inside a transaction that is committed on success
    /// and rolled back on failure.
    async fn execute_in_transaction(&self, sql: &str) -> Result<QueryResult>;

    async fn close(&self) -> Result<()>;
}
