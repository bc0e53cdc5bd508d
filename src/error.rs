//! Error types for querygate.
//!
//! Defines the error taxonomy shared by the synchronous pipeline and the
//! unattended job drainer.

use thiserror::Error;

/// Main error type for querygate operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The SQL generator failed, returned nothing, or timed out.
    #[error("SQL generation failed: {0}")]
    Generation(String),

    /// Lexical validation rejected the generated statement.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The environment policy forbids this kind of operation.
    #[error("Blocked by policy: {0}")]
    PolicyBlock(String),

    /// The query needs explicit confirmation before it can run.
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// The operation class is switched off in configuration.
    #[error("Operation disabled: {0}")]
    OperationDisabled(String),

    /// The database rejected or failed the statement.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Unknown query id, or the query already reached a terminal state.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// LLM API errors (rate limits, auth, timeouts, etc.)
    #[error("LLM error: {0}")]
    Llm(String),

    /// Configuration errors (invalid config file, bad env override, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// State database errors (history ledger, job queue).
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn policy_block(msg: impl Into<String>) -> Self {
        Self::PolicyBlock(msg.into())
    }

    pub fn confirmation_required(msg: impl Into<String>) -> Self {
        Self::ConfirmationRequired(msg.into())
    }

    pub fn operation_disabled(msg: impl Into<String>) -> Self {
        Self::OperationDisabled(msg.into())
    }

    /// Creates an execution error with the given message.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates an LLM error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Generation(_) => "Generation Error",
            Self::Validation(_) => "Validation Error",
            Self::PolicyBlock(_) => "Policy Block",
            Self::ConfirmationRequired(_) => "Confirmation Required",
            Self::OperationDisabled(_) => "Operation Disabled",
            Self::Execution(_) => "Execution Error",
            Self::NotFound(_) => "Not Found",
            Self::Connection(_) => "Connection Error",
            Self::Llm(_) => "LLM Error",
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Machine-readable kind persisted on failed queue jobs.
    pub fn job_error_kind(&self) -> &'static str {
        match self {
            Self::Generation(_) | Self::Llm(_) => "sql_generation_failed",
            Self::Validation(_) => "validation_failed",
            Self::PolicyBlock(_) => "environment_restriction",
            Self::OperationDisabled(_) => "operation_disabled",
            Self::Execution(_) | Self::Connection(_) => "sql_execution_error",
            _ => "unexpected_error",
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

/// Result type alias using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_generation() {
        let err = GatewayError::generation("generator timed out after 30s");
        assert_eq!(
            err.to_string(),
            "SQL generation failed: generator timed out after 30s"
        );
        assert_eq!(err.category(), "Generation Error");
    }

    #[test]
    fn test_error_display_execution() {
        let err = GatewayError::execution("column \"emal\" does not exist");
        assert_eq!(
            err.to_string(),
            "Execution error: column \"emal\" does not exist"
        );
        assert_eq!(err.category(), "Execution Error");
    }

    #[test]
    fn test_error_display_policy_block() {
        let err = GatewayError::policy_block("DELETE operations are not allowed in production");
        assert_eq!(
            err.to_string(),
            "Blocked by policy: DELETE operations are not allowed in production"
        );
        assert_eq!(err.category(), "Policy Block");
    }

    #[test]
    fn test_error_display_config() {
        let err = GatewayError::config("invalid BATCH_PROCESSING_SIZE: abc");
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid BATCH_PROCESSING_SIZE: abc"
        );
        assert_eq!(err.category(), "Configuration Error");
    }

    #[test]
    fn test_error_display_not_found() {
        let err = GatewayError::not_found("query abc");
        assert_eq!(err.to_string(), "Not found: query abc");
        assert_eq!(err.category(), "Not Found");
    }

    #[test]
    fn test_job_error_kind() {
        assert_eq!(
            GatewayError::generation("x").job_error_kind(),
            "sql_generation_failed"
        );
        assert_eq!(
            GatewayError::policy_block("x").job_error_kind(),
            "environment_restriction"
        );
        assert_eq!(
            GatewayError::operation_disabled("x").job_error_kind(),
            "operation_disabled"
        );
        assert_eq!(
            GatewayError::execution("x").job_error_kind(),
            "sql_execution_error"
        );
        assert_eq!(GatewayError::internal("x").job_error_kind(), "unexpected_error");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
