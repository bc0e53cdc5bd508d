//! Persistent job queue (`sql_queue`).
//!
//! Jobs move `pending -> processing -> completed | failed | blocked`. Claiming
//! is a single conditional UPDATE, so concurrent drainers never share a job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

use super::{format_timestamp, parse_id, parse_optional_timestamp, parse_timestamp};
use crate::error::{GatewayError, Result};
use crate::safety::{Classification, Environment, OperationKind, RiskLevel};

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Blocked,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(GatewayError::persistence(format!(
                "Unknown job status: {other}"
            ))),
        }
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub question: String,
    pub schema_snapshot: Option<JsonValue>,
    pub environment: String,
    pub language: String,
    pub actor: Option<String>,
    pub conversation_ref: Option<String>,
}

impl NewJob {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            schema_snapshot: None,
            environment: "dev".to_string(),
            language: "en".to_string(),
            actor: None,
            conversation_ref: None,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_conversation_ref(mut self, reference: impl Into<String>) -> Self {
        self.conversation_ref = Some(reference.into());
        self
    }

    pub fn with_schema(mut self, snapshot: JsonValue) -> Self {
        self.schema_snapshot = Some(snapshot);
        self
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub question: String,
    pub schema_snapshot: Option<JsonValue>,
    pub environment: String,
    pub language: String,
    pub actor: Option<String>,
    pub conversation_ref: Option<String>,
    pub status: JobStatus,
    pub sql: Option<String>,
    pub kind: Option<OperationKind>,
    pub risk: Option<RiskLevel>,
    pub execution_allowed: Option<bool>,
    /// Result rows as a JSON array of objects keyed by column name.
    pub results: Option<JsonValue>,
    pub rows_affected: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sql_generated_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_processing_ms: Option<u64>,
}

impl QueueJob {
    /// Deployment environment the job was submitted against.
    pub fn environment(&self) -> Environment {
        self.environment.parse().unwrap_or(Environment::NonProduction)
    }
}

/// Terminal update written by the drainer.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub sql: Option<String>,
    pub classification: Option<Classification>,
    pub execution_allowed: Option<bool>,
    pub results: Option<JsonValue>,
    pub rows_affected: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl JobCompletion {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            sql: None,
            classification: None,
            execution_allowed: None,
            results: None,
            rows_affected: None,
            elapsed_ms: None,
            response: None,
            error: None,
            error_kind: None,
            executed_at: None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct QueueJobRow {
    job_id: String,
    question: String,
    schema_info: Option<String>,
    environment: String,
    language: String,
    user_id: Option<String>,
    conversation_ref: Option<String>,
    status: String,
    sql_query: Option<String>,
    query_type: Option<String>,
    risk_level: Option<String>,
    execution_allowed: Option<bool>,
    query_results: Option<String>,
    rows_affected: Option<i64>,
    execution_time_ms: Option<i64>,
    natural_language_response: Option<String>,
    error_message: Option<String>,
    error_type: Option<String>,
    created_at: String,
    sql_generated_at: Option<String>,
    executed_at: Option<String>,
    completed_at: Option<String>,
    total_processing_time_ms: Option<i64>,
}

/// A claimed row with its insertion order, the tiebreak for equal timestamps.
#[derive(Debug, FromRow)]
struct ClaimedRow {
    seq: i64,
    #[sqlx(flatten)]
    job: QueueJobRow,
}

fn parse_json(raw: Option<String>) -> Result<Option<JsonValue>> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| GatewayError::persistence(format!("Invalid JSON payload: {e}")))
    })
    .transpose()
}

fn to_u64(n: Option<i64>) -> Option<u64> {
    n.map(|n| n.max(0) as u64)
}

impl TryFrom<QueueJobRow> for QueueJob {
    type Error = GatewayError;

    fn try_from(row: QueueJobRow) -> Result<Self> {
        Ok(Self {
            id: parse_id(&row.job_id)?,
            question: row.question,
            schema_snapshot: parse_json(row.schema_info)?,
            environment: row.environment,
            language: row.language,
            actor: row.user_id,
            conversation_ref: row.conversation_ref,
            status: row.status.parse()?,
            sql: row.sql_query,
            kind: row.query_type.as_deref().map(str::parse).transpose()?,
            risk: row.risk_level.as_deref().map(str::parse).transpose()?,
            execution_allowed: row.execution_allowed,
            results: parse_json(row.query_results)?,
            rows_affected: to_u64(row.rows_affected),
            elapsed_ms: to_u64(row.execution_time_ms),
            response: row.natural_language_response,
            error: row.error_message,
            error_kind: row.error_type,
            created_at: parse_timestamp(&row.created_at)?,
            sql_generated_at: parse_optional_timestamp(row.sql_generated_at)?,
            executed_at: parse_optional_timestamp(row.executed_at)?,
            completed_at: parse_optional_timestamp(row.completed_at)?,
            total_processing_ms: to_u64(row.total_processing_time_ms),
        })
    }
}

fn collect_jobs(rows: Vec<QueueJobRow>) -> Result<Vec<QueueJob>> {
    rows.into_iter().map(QueueJob::try_from).collect()
}

/// Job queue stored in the state database.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a pending job and returns its id.
    pub async fn enqueue(&self, job: &NewJob) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let schema = job
            .schema_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| GatewayError::persistence(format!("Invalid schema snapshot: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sql_queue
            (job_id, question, schema_info, environment, language, user_id, conversation_ref,
             status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&job.question)
        .bind(schema)
        .bind(&job.environment)
        .bind(&job.language)
        .bind(&job.actor)
        .bind(&job.conversation_ref)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to enqueue job: {e}")))?;

        debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Atomically moves up to `limit` of the oldest pending jobs to
    /// `processing` and returns them oldest first.
    pub async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueJob>> {
        let mut rows: Vec<ClaimedRow> = sqlx::query_as(
            r#"
            UPDATE sql_queue
            SET status = 'processing'
            WHERE job_id IN (
                SELECT job_id FROM sql_queue
                WHERE status = 'pending'
                ORDER BY created_at, rowid
                LIMIT ?
            )
            AND status = 'pending'
            RETURNING rowid AS seq, *
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to claim jobs: {e}")))?;

        // RETURNING order is unspecified; timestamps are fixed-width so they sort as text.
        rows.sort_by(|a, b| {
            a.job
                .created_at
                .cmp(&b.job.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        collect_jobs(rows.into_iter().map(|row| row.job).collect())
    }

    /// Stores the generated statement, its classification and when it was
    /// generated.
    pub async fn record_generated(
        &self,
        id: Uuid,
        sql: &str,
        classification: Classification,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sql_queue
            SET sql_query = ?, query_type = ?, risk_level = ?, sql_generated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(sql)
        .bind(classification.kind.as_str())
        .bind(classification.risk.as_str())
        .bind(format_timestamp(&generated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to record generated SQL: {e}")))?;

        Ok(())
    }

    /// Writes the terminal state of a processing job, stamping the total
    /// time since it was created.
    pub async fn complete(&self, id: Uuid, completion: &JobCompletion) -> Result<()> {
        if !completion.status.is_terminal() {
            return Err(GatewayError::internal(format!(
                "cannot complete job with non-terminal status {}",
                completion.status
            )));
        }

        let job = self
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("job {id}")))?;

        let now = Utc::now();
        let total_ms = (now - job.created_at).num_milliseconds().max(0);
        let results = completion
            .results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| GatewayError::persistence(format!("Invalid result payload: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE sql_queue
            SET status = ?,
                sql_query = COALESCE(?, sql_query),
                query_type = COALESCE(?, query_type),
                risk_level = COALESCE(?, risk_level),
                execution_allowed = ?,
                query_results = ?,
                rows_affected = ?,
                execution_time_ms = ?,
                natural_language_response = ?,
                error_message = ?,
                error_type = ?,
                executed_at = ?,
                completed_at = ?,
                total_processing_time_ms = ?
            WHERE job_id = ? AND status = 'processing'
            "#,
        )
        .bind(completion.status.as_str())
        .bind(&completion.sql)
        .bind(completion.classification.map(|c| c.kind.as_str()))
        .bind(completion.classification.map(|c| c.risk.as_str()))
        .bind(completion.execution_allowed)
        .bind(results)
        .bind(completion.rows_affected.map(|n| n as i64))
        .bind(completion.elapsed_ms.map(|n| n as i64))
        .bind(&completion.response)
        .bind(&completion.error)
        .bind(&completion.error_kind)
        .bind(completion.executed_at.as_ref().map(format_timestamp))
        .bind(format_timestamp(&now))
        .bind(total_ms)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::persistence(format!("Failed to complete job: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::not_found(format!(
                "job {id} is not processing (status {})",
                job.status
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueJob>> {
        let row: Option<QueueJobRow> = sqlx::query_as("SELECT * FROM sql_queue WHERE job_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewayError::persistence(format!("Failed to get job: {e}")))?;

        row.map(QueueJob::try_from).transpose()
    }

    /// Most recently created jobs first.
    pub async fn list(&self, limit: usize) -> Result<Vec<QueueJob>> {
        let rows: Vec<QueueJobRow> =
            sqlx::query_as("SELECT * FROM sql_queue ORDER BY created_at DESC, rowid DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| GatewayError::persistence(format!("Failed to list jobs: {e}")))?;

        collect_jobs(rows)
    }

    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sql_queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
