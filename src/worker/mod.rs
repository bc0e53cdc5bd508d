//! Asynchronous path: drains the persisted job queue through the pipeline.

mod drainer;
mod notifier;
mod response;

pub use drainer::{BatchSummary, JobDrainer};
pub use notifier::{LogNotifier, Notifier};
pub use response::{admin_disabled_message, blocked_message, error_message, success_message};
