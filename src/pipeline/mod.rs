//! The safety-gated execution pipeline.
//!
//! Both entry paths converge here. The synchronous path is
//! `submit -> (preview) -> confirm/execute`; the job drainer calls
//! `run_unattended`, which replaces the confirmation wait with the
//! environment policy. The pipeline is the only owner of the pending-query
//! store and the only writer of the history log.

mod pending;

pub use pending::{LifecycleState, PendingQuery};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{ExecutionGateway, GatewayRun, Schema};
use crate::error::{GatewayError, Result};
use crate::language::Language;
use crate::llm::{GeneratedSql, SqlGenerator};
use crate::persistence::{ExecutionRecord, HistoryEntry, HistoryStore, QueueJob};
use crate::safety::{
    classify, estimate_impact, evaluate_policy, validate, Classification, Environment,
    OperationKind,
};
use pending::{ClaimPolicy, PendingStore};

/// Previews above this many rows carry a "Large operation" warning.
pub const LARGE_OPERATION_THRESHOLD: u64 = 100;

/// A JSON object keyed by column name.
pub type JsonRow = Map<String, JsonValue>;

/// Gates applied by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub require_confirmation: bool,
    pub enable_admin_operations: bool,
    pub generation_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            enable_admin_operations: false,
            generation_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            require_confirmation: config.safety.require_confirmation,
            enable_admin_operations: config.safety.enable_admin_operations,
            generation_timeout: config.generation.timeout(),
        }
    }
}

/// A question submitted on the synchronous path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub question: String,
    pub actor: Option<String>,
    /// Detected from the question when absent.
    pub language: Option<Language>,
    /// Run low-risk reads straight away instead of returning them pending.
    pub execute_immediately: bool,
}

impl SubmitRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            actor: None,
            language: None,
            execute_immediately: false,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn execute_immediately(mut self) -> Self {
        self.execute_immediately = true;
        self
    }
}

/// Result of `Pipeline::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub query: PendingQuery,
    /// Which generator produced the statement.
    pub method: String,
    /// Present when the query ran in-line.
    pub outcome: Option<ExecutionOutcome>,
}

/// Rows an UPDATE or DELETE would touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub query_id: Uuid,
    pub affected_rows: u64,
    pub sample_rows: Vec<JsonRow>,
    pub warnings: Vec<String>,
}

/// Result of executing a pending query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub query_id: Uuid,
    pub success: bool,
    pub message: String,
    pub rows_affected: Option<u64>,
    /// Result rows, reads only.
    pub rows: Option<Vec<JsonRow>>,
    pub elapsed_ms: u64,
    /// Writes are committed; there is no undo.
    pub can_rollback: bool,
}

/// A generated statement after classification and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessedStatement {
    pub sql: String,
    pub explanation: String,
    pub method: String,
    pub classification: Classification,
    pub warnings: Vec<String>,
    pub estimated_impact: String,
    pub generated_at: DateTime<Utc>,
}

/// Result of running a queued job through the pipeline.
#[derive(Debug)]
pub enum UnattendedOutcome {
    /// The statement ran and committed.
    Executed {
        statement: AssessedStatement,
        run: GatewayRun,
        executed_at: DateTime<Utc>,
    },
    /// Policy refused the statement; nothing ran.
    Blocked {
        statement: AssessedStatement,
        cause: BlockCause,
        /// `PolicyBlock` or `OperationDisabled`, matching `cause`.
        error: GatewayError,
    },
    /// Generation, validation or execution failed.
    Failed {
        statement: Option<AssessedStatement>,
        error: GatewayError,
    },
}

/// Why an unattended statement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCause {
    /// The environment policy table forbids the kind here.
    Environment(Environment),
    /// ADMIN statements are switched off in configuration, in any environment.
    AdminDisabled,
}

impl UnattendedOutcome {
    pub fn statement(&self) -> Option<&AssessedStatement> {
        match self {
            Self::Executed { statement, .. } | Self::Blocked { statement, .. } => Some(statement),
            Self::Failed { statement, .. } => statement.as_ref(),
        }
    }
}

/// Orchestrates generation, classification, gating, execution and history.
pub struct Pipeline {
    generator: Arc<dyn SqlGenerator>,
    gateway: ExecutionGateway,
    history: Arc<dyn HistoryStore>,
    pending: PendingStore,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        gateway: ExecutionGateway,
        history: Arc<dyn HistoryStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            generator,
            gateway,
            history,
            pending: PendingStore::new(),
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Generates, classifies and validates a statement, then stores it as
    /// pending and appends an unexecuted history entry.
    ///
    /// Low-risk reads submitted with `execute_immediately` run in-line.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission> {
        let language = request
            .language
            .unwrap_or_else(|| Language::detect(&request.question));
        let schema = self.gateway.database().introspect_schema().await?;
        let statement = self.assess(&request.question, &schema, language).await?;

        let classification = statement.classification;
        let requires_confirmation =
            self.options.require_confirmation && classification.needs_confirmation();

        let query = PendingQuery {
            id: Uuid::new_v4(),
            question: request.question.clone(),
            sql: statement.sql.clone(),
            kind: classification.kind,
            risk: classification.risk,
            explanation: statement.explanation.clone(),
            estimated_impact: statement.estimated_impact.clone(),
            warnings: statement.warnings.clone(),
            created_at: statement.generated_at,
            actor: request.actor.clone(),
            state: LifecycleState::Generated,
            requires_confirmation,
        };
        let id = query.id;

        self.pending.insert(query.clone())?;
        self.history
            .append(&HistoryEntry::new(
                id,
                &request.question,
                &statement.sql,
                classification,
                request.actor.clone(),
            ))
            .await?;

        info!(
            query_id = %id,
            kind = %classification.kind,
            risk = %classification.risk,
            requires_confirmation,
            "Query submitted"
        );

        let outcome = if request.execute_immediately
            && !requires_confirmation
            && classification.kind.is_read()
        {
            Some(self.execute(id, false).await?)
        } else {
            None
        };

        let query = self.pending.get(id)?.unwrap_or(query);
        Ok(Submission {
            query,
            method: statement.method,
            outcome,
        })
    }

    /// Counts and samples the rows a pending UPDATE or DELETE would touch.
    pub async fn preview(&self, id: Uuid) -> Result<Preview> {
        let query = self.require(id)?;
        if !query.kind.is_write() {
            return Err(GatewayError::validation(format!(
                "Preview is only available for write statements, not {}",
                query.kind
            )));
        }

        let impact = self.gateway.preview(&query.sql).await?;
        let mut warnings = query.warnings.clone();
        if impact.affected_rows > LARGE_OPERATION_THRESHOLD {
            warnings.push(format!(
                "Large operation: {} rows will be affected",
                impact.affected_rows
            ));
        }

        debug!(query_id = %id, affected_rows = impact.affected_rows, "Preview computed");
        Ok(Preview {
            query_id: id,
            affected_rows: impact.affected_rows,
            sample_rows: impact.sample.to_json_rows(),
            warnings,
        })
    }

    /// Runs a pending query.
    ///
    /// Fails with `NotFound` when the id is unknown or the query is no
    /// longer awaiting execution, `ConfirmationRequired` when it needs a
    /// confirmation that was not given, and `OperationDisabled` for ADMIN
    /// statements while admin operations are off. The last two leave the
    /// query untouched. A database failure is reported in the outcome.
    pub async fn execute(&self, id: Uuid, confirmed: bool) -> Result<ExecutionOutcome> {
        let query = self.pending.claim(
            id,
            ClaimPolicy {
                confirmed,
                admin_enabled: self.options.enable_admin_operations,
            },
        )?;

        let (outcome, record) = match self.gateway.run(query.kind, &query.sql).await {
            Ok(run) => success_outcome(id, query.kind, run),
            Err(e) => {
                warn!(query_id = %id, error = %e, "Query execution failed");
                failure_outcome(id, e)
            }
        };

        self.pending.finish(id, outcome.success)?;
        if let Err(e) = self.history.mark_executed(id, &record).await {
            // The statement already ran; report its outcome regardless.
            warn!(query_id = %id, error = %e, "Failed to update history entry");
        }

        Ok(outcome)
    }

    /// `yes` confirms and executes the query; `no` cancels it.
    ///
    /// Returns the execution outcome, or `None` when cancelled.
    pub async fn confirm(&self, id: Uuid, yes: bool) -> Result<Option<ExecutionOutcome>> {
        if !yes {
            self.cancel(id)?;
            return Ok(None);
        }

        self.pending.confirm(id)?;
        info!(query_id = %id, "Query confirmed");
        self.execute(id, true).await.map(Some)
    }

    pub fn cancel(&self, id: Uuid) -> Result<()> {
        self.pending.cancel(id)?;
        info!(query_id = %id, "Query cancelled");
        Ok(())
    }

    /// A snapshot of a pending query.
    pub fn get(&self, id: Uuid) -> Result<Option<PendingQuery>> {
        self.pending.get(id)
    }

    /// Most recent history entries first.
    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.history.recent(limit).await
    }

    /// Runs a queued job without a confirmation wait.
    ///
    /// The environment policy (and the admin toggle) decide whether the
    /// statement may run. Never returns an error: every failure is folded
    /// into the outcome so the caller can persist it.
    pub async fn run_unattended(&self, job: &QueueJob) -> UnattendedOutcome {
        let language = job
            .language
            .parse()
            .unwrap_or_else(|_| Language::detect(&job.question));

        let schema = match self.job_schema(job).await {
            Ok(schema) => schema,
            Err(error) => {
                return UnattendedOutcome::Failed {
                    statement: None,
                    error,
                }
            }
        };

        let statement = match self.assess(&job.question, &schema, language).await {
            Ok(statement) => statement,
            Err(error) => {
                return UnattendedOutcome::Failed {
                    statement: None,
                    error,
                }
            }
        };

        let classification = statement.classification;
        let environment = job.environment();
        let decision = evaluate_policy(classification.kind, environment);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("{} is not allowed in {}", classification.kind, environment));
            info!(job_id = %job.id, %environment, kind = %classification.kind, "Job blocked by policy");
            return UnattendedOutcome::Blocked {
                statement,
                cause: BlockCause::Environment(environment),
                error: GatewayError::policy_block(reason),
            };
        }
        if classification.kind == OperationKind::Admin && !self.options.enable_admin_operations {
            info!(job_id = %job.id, %environment, "ADMIN job blocked, admin operations disabled");
            return UnattendedOutcome::Blocked {
                statement,
                cause: BlockCause::AdminDisabled,
                error: GatewayError::operation_disabled("Administrative operations are disabled"),
            };
        }

        let entry = HistoryEntry::new(
            job.id,
            &job.question,
            &statement.sql,
            classification,
            job.actor.clone(),
        );
        if let Err(e) = self.history.append(&entry).await {
            warn!(job_id = %job.id, error = %e, "Failed to append history entry");
        }

        let executed_at = Utc::now();
        let result = self.gateway.run(classification.kind, &statement.sql).await;
        let record = match &result {
            Ok(run) => ExecutionRecord {
                success: true,
                rows_affected: Some(run.result.effective_row_count()),
                elapsed_ms: run.elapsed_ms,
                error: None,
            },
            Err(e) => ExecutionRecord {
                success: false,
                rows_affected: None,
                elapsed_ms: 0,
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = self.history.mark_executed(job.id, &record).await {
            warn!(job_id = %job.id, error = %e, "Failed to update history entry");
        }

        match result {
            Ok(run) => UnattendedOutcome::Executed {
                statement,
                run,
                executed_at,
            },
            Err(error) => UnattendedOutcome::Failed {
                statement: Some(statement),
                error,
            },
        }
    }

    /// The job's schema snapshot, or a fresh introspection when it has none.
    async fn job_schema(&self, job: &QueueJob) -> Result<Schema> {
        if let Some(snapshot) = &job.schema_snapshot {
            match serde_json::from_value::<Schema>(snapshot.clone()) {
                Ok(schema) => return Ok(schema),
                Err(e) => warn!(job_id = %job.id, error = %e, "Ignoring unreadable schema snapshot"),
            }
        }
        self.gateway.database().introspect_schema().await
    }

    /// Generate, classify and validate. Shared by both paths so every
    /// statement is classified exactly once before any decision.
    async fn assess(
        &self,
        question: &str,
        schema: &Schema,
        language: Language,
    ) -> Result<AssessedStatement> {
        let timeout = self.options.generation_timeout;
        let generated: GeneratedSql =
            tokio::time::timeout(timeout, self.generator.generate(question, schema, language))
                .await
                .map_err(|_| {
                    GatewayError::generation(format!(
                        "{} generator timed out after {}s",
                        self.generator.name(),
                        timeout.as_secs()
                    ))
                })??;
        let generated_at = Utc::now();

        let mut classification = classify(&generated.sql);
        if let Some(reported) = generated.reported {
            classification = classification.escalate(reported);
        }

        let report = validate(&generated.sql, classification.kind);
        if !report.ok {
            return Err(GatewayError::validation(report.warnings.join("; ")));
        }

        let estimated_impact = estimate_impact(&generated.sql, classification.kind);
        debug!(
            method = %generated.method,
            kind = %classification.kind,
            risk = %classification.risk,
            "Statement assessed"
        );

        Ok(AssessedStatement {
            sql: generated.sql,
            explanation: generated.explanation,
            method: generated.method,
            classification,
            warnings: report.warnings,
            estimated_impact,
            generated_at,
        })
    }

    fn require(&self, id: Uuid) -> Result<PendingQuery> {
        self.pending
            .get(id)?
            .ok_or_else(|| GatewayError::not_found(format!("Query {} not found", id)))
    }
}

fn success_outcome(id: Uuid, kind: OperationKind, run: GatewayRun) -> (ExecutionOutcome, ExecutionRecord) {
    let rows_affected = run.result.effective_row_count();
    let (message, rows) = if kind.is_read() {
        let mut message = format!("Query returned {} rows", run.result.row_count);
        if let Some(warning) = run.result.truncation_warning() {
            message = format!("{message}. {warning}");
        }
        (message, Some(run.result.to_json_rows()))
    } else {
        (format!("{} rows affected", rows_affected), None)
    };

    let outcome = ExecutionOutcome {
        query_id: id,
        success: true,
        message,
        rows_affected: Some(rows_affected),
        rows,
        elapsed_ms: run.elapsed_ms,
        can_rollback: false,
    };
    let record = ExecutionRecord {
        success: true,
        rows_affected: Some(rows_affected),
        elapsed_ms: run.elapsed_ms,
        error: None,
    };
    (outcome, record)
}

fn failure_outcome(id: Uuid, error: GatewayError) -> (ExecutionOutcome, ExecutionRecord) {
    let message = error.to_string();
    let outcome = ExecutionOutcome {
        query_id: id,
        success: false,
        message: message.clone(),
        rows_affected: None,
        rows: None,
        elapsed_ms: 0,
        can_rollback: false,
    };
    let record = ExecutionRecord {
        success: false,
        rows_affected: None,
        elapsed_ms: 0,
        error: Some(message),
    };
    (outcome, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnInfo, MockDatabaseClient, QueryResult, Value};
    use crate::llm::{LlmGenerator, MockLlmClient};
    use crate::persistence::MemoryHistory;
    use crate::safety::RiskLevel;
    use pretty_assertions::assert_eq;

    struct Harness {
        pipeline: Pipeline,
        db: Arc<MockDatabaseClient>,
    }

    fn harness_with(
        llm: MockLlmClient,
        db: MockDatabaseClient,
        options: PipelineOptions,
    ) -> Harness {
        let db = Arc::new(db);
        let pipeline = Pipeline::new(
            Arc::new(LlmGenerator::new(Arc::new(llm))),
            ExecutionGateway::new(db.clone()),
            Arc::new(MemoryHistory::new()),
            options,
        );
        Harness { pipeline, db }
    }

    fn harness(llm: MockLlmClient) -> Harness {
        harness_with(llm, MockDatabaseClient::new(), PipelineOptions::default())
    }

    fn sql_reply(sql: &str) -> String {
        format!("```sql\n{}\n```", sql)
    }

    #[tokio::test]
    async fn test_submit_read_is_pending_without_confirmation() {
        let h = harness(MockLlmClient::new());
        let submission = h
            .pipeline
            .submit(SubmitRequest::new("count orders"))
            .await
            .unwrap();

        assert_eq!(submission.query.kind, OperationKind::Read);
        assert_eq!(submission.query.risk, RiskLevel::Low);
        assert!(!submission.query.requires_confirmation);
        assert_eq!(submission.query.state, LifecycleState::Generated);
        assert!(submission.outcome.is_none());
        assert!(h.db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_submit_execute_immediately_runs_reads() {
        let count = QueryResult::with_data(
            vec![ColumnInfo::new("count", "bigint")],
            vec![vec![Value::Int(42)]],
        );
        let h = harness_with(
            MockLlmClient::new(),
            MockDatabaseClient::new().with_result("count(*)", count),
            PipelineOptions::default(),
        );

        let submission = h
            .pipeline
            .submit(SubmitRequest::new("count orders").execute_immediately())
            .await
            .unwrap();

        let outcome = submission.outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.rows.unwrap()[0]["count"], serde_json::json!(42));
        assert_eq!(submission.query.state, LifecycleState::Executed);

        let history = h.pipeline.history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].executed);
        assert_eq!(history[0].success, Some(true));
    }

    #[tokio::test]
    async fn test_submit_execute_immediately_skips_writes() {
        let llm = MockLlmClient::new().with_response("archive", sql_reply("DELETE FROM t WHERE id = 5"));
        let h = harness(llm);

        let submission = h
            .pipeline
            .submit(SubmitRequest::new("archive row 5").execute_immediately())
            .await
            .unwrap();

        assert_eq!(submission.query.kind, OperationKind::WriteSafe);
        assert_eq!(submission.query.risk, RiskLevel::Medium);
        assert!(submission.query.requires_confirmation);
        assert!(submission.outcome.is_none());
        assert!(h.db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_reported_classification_only_escalates() {
        let llm = MockLlmClient::new().with_response(
            "report",
            r#"{"sql": "SELECT * FROM reports", "query_type": "ADMIN", "risk_level": "critical", "explanation": "x"}"#,
        );
        let h = harness(llm);
        let submission = h
            .pipeline
            .submit(SubmitRequest::new("report"))
            .await
            .unwrap();
        assert_eq!(submission.query.kind, OperationKind::Admin);
        assert_eq!(submission.query.risk, RiskLevel::Critical);

        let llm = MockLlmClient::new().with_response(
            "purge",
            r#"{"sql": "DELETE FROM logs", "query_type": "READ", "risk_level": "low", "explanation": "x"}"#,
        );
        let h = harness(llm);
        let submission = h
            .pipeline
            .submit(SubmitRequest::new("purge"))
            .await
            .unwrap();
        assert_eq!(submission.query.kind, OperationKind::WriteRisky);
        assert_eq!(submission.query.risk, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_validation_failure_stores_nothing() {
        let llm = MockLlmClient::new().with_response("tables", sql_reply("SHOW TABLES"));
        let h = harness(llm);

        let err = h
            .pipeline
            .submit(SubmitRequest::new("list tables"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(h.pipeline.history(10).await.unwrap().is_empty());
        assert_eq!(h.pipeline.pending.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generation_timeout() {
        let options = PipelineOptions {
            generation_timeout: Duration::from_millis(20),
            ..PipelineOptions::default()
        };
        let h = harness_with(
            MockLlmClient::new().with_delay(Duration::from_secs(5)),
            MockDatabaseClient::new(),
            options,
        );

        let err = h
            .pipeline
            .submit(SubmitRequest::new("count orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Generation(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unconfirmed_execute_leaves_generated() {
        let llm = MockLlmClient::new().with_response("archive", sql_reply("DELETE FROM t WHERE id = 5"));
        let h = harness(llm);
        let id = h
            .pipeline
            .submit(SubmitRequest::new("archive"))
            .await
            .unwrap()
            .query
            .id;

        let err = h.pipeline.execute(id, false).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConfirmationRequired(_)));
        assert_eq!(
            h.pipeline.get(id).unwrap().unwrap().state,
            LifecycleState::Generated
        );
        assert!(h.db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_toggle_off() {
        let llm = MockLlmClient::new().with_response("archive", sql_reply("DELETE FROM t WHERE id = 5"));
        let options = PipelineOptions {
            require_confirmation: false,
            ..PipelineOptions::default()
        };
        let h = harness_with(llm, MockDatabaseClient::new(), options);
        let submission = h
            .pipeline
            .submit(SubmitRequest::new("archive"))
            .await
            .unwrap();
        assert!(!submission.query.requires_confirmation);

        let outcome = h.pipeline.execute(submission.query.id, false).await.unwrap();
        assert!(outcome.success);
        assert!(h.db.executed()[0].transactional);
    }

    #[tokio::test]
    async fn test_execute_twice_runs_once() {
        let h = harness(MockLlmClient::new());
        let id = h
            .pipeline
            .submit(SubmitRequest::new("count orders"))
            .await
            .unwrap()
            .query
            .id;

        assert!(h.pipeline.execute(id, false).await.unwrap().success);
        let err = h.pipeline.execute(id, false).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(h.db.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_disabled() {
        let llm = MockLlmClient::new().with_response("drop", sql_reply("DROP TABLE staging"));
        let h = harness(llm);
        let id = h
            .pipeline
            .submit(SubmitRequest::new("drop staging"))
            .await
            .unwrap()
            .query
            .id;

        let err = h.pipeline.execute(id, true).await.unwrap_err();
        assert!(matches!(err, GatewayError::OperationDisabled(_)));
        assert_eq!(
            h.pipeline.get(id).unwrap().unwrap().state,
            LifecycleState::Generated
        );
    }

    #[tokio::test]
    async fn test_execution_failure_is_reported_in_outcome() {
        let llm = MockLlmClient::new().with_response("archive", sql_reply("DELETE FROM t WHERE id = 5"));
        let h = harness_with(
            llm,
            MockDatabaseClient::new().with_failure("delete from t", "permission denied for table t"),
            PipelineOptions::default(),
        );
        let id = h
            .pipeline
            .submit(SubmitRequest::new("archive"))
            .await
            .unwrap()
            .query
            .id;

        let outcome = h.pipeline.confirm(id, true).await.unwrap().unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("permission denied"));
        assert!(!outcome.can_rollback);
        assert_eq!(h.pipeline.get(id).unwrap().unwrap().state, LifecycleState::Failed);

        let history = h.pipeline.history(1).await.unwrap();
        assert_eq!(history[0].success, Some(false));
        assert!(history[0].error.as_deref().unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let llm = MockLlmClient::new().with_response("archive", sql_reply("DELETE FROM t WHERE id = 5"));
        let h = harness(llm);
        let id = h
            .pipeline
            .submit(SubmitRequest::new("archive"))
            .await
            .unwrap()
            .query
            .id;

        assert!(h.pipeline.confirm(id, false).await.unwrap().is_none());
        assert_eq!(
            h.pipeline.get(id).unwrap().unwrap().state,
            LifecycleState::Cancelled
        );
        assert!(matches!(
            h.pipeline.confirm(id, true).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(h.db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_preview_large_operation() {
        let llm = MockLlmClient::new().with_response("stale", sql_reply("DELETE FROM sessions WHERE status = 'stale'"));
        let count = QueryResult::with_data(
            vec![ColumnInfo::new("affected", "bigint")],
            vec![vec![Value::Int(250)]],
        );
        let h = harness_with(
            llm,
            MockDatabaseClient::new().with_result("count(*)", count),
            PipelineOptions::default(),
        );
        let id = h
            .pipeline
            .submit(SubmitRequest::new("remove stale sessions"))
            .await
            .unwrap()
            .query
            .id;

        let preview = h.pipeline.preview(id).await.unwrap();
        assert_eq!(preview.affected_rows, 250);
        assert!(preview
            .warnings
            .contains(&"Large operation: 250 rows will be affected".to_string()));
        assert!(h.db.executed().iter().all(|s| !s.transactional));
        assert_eq!(
            h.pipeline.get(id).unwrap().unwrap().state,
            LifecycleState::Generated
        );
    }

    #[tokio::test]
    async fn test_preview_rejects_reads() {
        let h = harness(MockLlmClient::new());
        let id = h
            .pipeline
            .submit(SubmitRequest::new("count orders"))
            .await
            .unwrap()
            .query
            .id;
        assert!(matches!(
            h.pipeline.preview(id).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            h.pipeline.preview(Uuid::new_v4()).await,
            Err(GatewayError::NotFound(_))
        ));
    }
}
