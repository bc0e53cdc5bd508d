//! Delivery of job results back to whoever submitted them.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::persistence::QueueJob;

/// Tells the originating channel that a job finished.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `job` is the state after the terminal update; `message` is the
    /// localized reply.
    async fn notify(&self, job: &QueueJob, message: &str) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, job: &QueueJob, message: &str) -> Result<()> {
        info!(
            job_id = %job.id,
            status = %job.status,
            actor = job.actor.as_deref().unwrap_or("-"),
            conversation = job.conversation_ref.as_deref().unwrap_or("-"),
            "{}",
            message
        );
        Ok(())
    }
}
