//! The job queue drainer.
//!
//! Claims pending jobs in batches, runs each through the pipeline without a
//! confirmation wait, persists the terminal state and notifies the
//! submitter. Jobs in a batch run sequentially; one job's failure never
//! stops the batch.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::notifier::Notifier;
use super::response::{admin_disabled_message, blocked_message, error_message, success_message};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::language::Language;
use crate::persistence::{JobCompletion, JobQueue, JobStatus, QueueJob};
use crate::pipeline::{BlockCause, Pipeline, UnattendedOutcome};

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Error kind for failures outside the pipeline (e.g. persisting a result).
const UNEXPECTED_ERROR: &str = "unexpected_error";

/// Counts of one drained batch, by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl BatchSummary {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Blocked => self.blocked += 1,
            _ => self.failed += 1,
        }
    }
}

/// Long-lived worker that drains the job queue.
pub struct JobDrainer {
    pipeline: Arc<Pipeline>,
    queue: JobQueue,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
    poll_interval: Duration,
}

impl JobDrainer {
    pub fn new(pipeline: Arc<Pipeline>, queue: JobQueue, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            pipeline,
            queue,
            notifier,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_config(self, config: &WorkerConfig) -> Self {
        self.with_batch_size(config.batch_size)
            .with_poll_interval(config.poll_interval())
    }

    /// Claims and processes one batch. An empty queue is a no-op.
    pub async fn drain_once(&self) -> Result<BatchSummary> {
        let jobs = self.queue.claim_batch(self.batch_size).await?;
        let mut summary = BatchSummary {
            claimed: jobs.len(),
            ..BatchSummary::default()
        };
        if jobs.is_empty() {
            debug!("No pending jobs");
            return Ok(summary);
        }

        info!(count = jobs.len(), "Processing job batch");
        for job in jobs {
            let status = match self.process(&job).await {
                Ok(status) => status,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Job processing failed unexpectedly");
                    self.fail_unexpectedly(&job, &e.to_string()).await;
                    JobStatus::Failed
                }
            };
            summary.record(status);
        }

        info!(
            completed = summary.completed,
            blocked = summary.blocked,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Drains batches until `cancel` fires, sleeping `poll_interval`
    /// between polls. A batch in progress is finished before stopping.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Job drainer started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.drain_once().await {
                warn!(error = %e, "Failed to drain job queue");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Job drainer stopped");
    }

    async fn process(&self, job: &QueueJob) -> Result<JobStatus> {
        let language: Language = job
            .language
            .parse()
            .unwrap_or_else(|_| Language::detect(&job.question));

        let outcome = self.pipeline.run_unattended(job).await;

        if let Some(statement) = outcome.statement() {
            self.queue
                .record_generated(
                    job.id,
                    &statement.sql,
                    statement.classification,
                    statement.generated_at,
                )
                .await?;
        }

        let completion = completion_for(outcome, language);
        let status = completion.status;
        let message = completion
            .response
            .clone()
            .unwrap_or_default();

        self.queue.complete(job.id, &completion).await?;
        info!(job_id = %job.id, status = %status, "Job finished");

        self.notify(job, &message).await;
        Ok(status)
    }

    /// Best-effort terminal update after an error outside the pipeline.
    async fn fail_unexpectedly(&self, job: &QueueJob, error: &str) {
        let mut completion = JobCompletion::new(JobStatus::Failed);
        completion.error = Some(error.to_string());
        completion.error_kind = Some(UNEXPECTED_ERROR.to_string());

        if let Err(e) = self.queue.complete(job.id, &completion).await {
            error!(job_id = %job.id, error = %e, "Could not mark job as failed");
            return;
        }
        self.notify(job, error).await;
    }

    async fn notify(&self, job: &QueueJob, message: &str) {
        let current = match self.queue.get(job.id).await {
            Ok(Some(current)) => current,
            _ => job.clone(),
        };
        if let Err(e) = self.notifier.notify(&current, message).await {
            warn!(job_id = %job.id, error = %e, "Failed to notify submitter");
        }
    }
}

/// Maps a pipeline outcome to the job's terminal update.
fn completion_for(outcome: UnattendedOutcome, language: Language) -> JobCompletion {
    match outcome {
        UnattendedOutcome::Executed {
            statement,
            run,
            executed_at,
        } => {
            let kind = statement.classification.kind;
            let mut completion = JobCompletion::new(JobStatus::Completed);
            completion.response = Some(success_message(language, kind, &run.result));
            if kind.is_read() {
                completion.results = Some(JsonValue::Array(
                    run.result
                        .to_json_rows()
                        .into_iter()
                        .map(JsonValue::Object)
                        .collect(),
                ));
            }
            completion.rows_affected = Some(run.result.effective_row_count());
            completion.elapsed_ms = Some(run.elapsed_ms);
            completion.executed_at = Some(executed_at);
            completion.execution_allowed = Some(true);
            completion.sql = Some(statement.sql);
            completion.classification = Some(statement.classification);
            completion
        }
        UnattendedOutcome::Blocked {
            statement,
            cause,
            error,
        } => {
            let mut completion = JobCompletion::new(JobStatus::Blocked);
            completion.response = Some(match cause {
                BlockCause::Environment(_) => blocked_message(language, statement.classification.kind),
                BlockCause::AdminDisabled => admin_disabled_message(language),
            });
            completion.error_kind = Some(error.job_error_kind().to_string());
            completion.error = Some(error.to_string());
            completion.execution_allowed = Some(false);
            completion.sql = Some(statement.sql);
            completion.classification = Some(statement.classification);
            completion
        }
        UnattendedOutcome::Failed { statement, error } => {
            let text = error.to_string();
            let mut completion = JobCompletion::new(JobStatus::Failed);
            completion.response = Some(error_message(language, &text));
            completion.error_kind = Some(error.job_error_kind().to_string());
            completion.error = Some(text);
            if let Some(statement) = statement {
                // Only execution failures carry a statement.
                completion.execution_allowed = Some(true);
                completion.sql = Some(statement.sql);
                completion.classification = Some(statement.classification);
            }
            completion
        }
    }
}
