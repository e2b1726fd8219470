/// Engine error types
///
/// One enum covers every failure the engine surfaces to its callers. Flow and
/// task bodies keep using `anyhow::Result`; their errors travel inside
/// [`FlowyError::Execution`].
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowyError {
    /// Rejected input at an API boundary (bad cron, bad trigger fields, ...)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown flow, trigger or history id on a mutating path
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The flow body returned an error (or panicked). The failure has already
    /// been recorded on the history row identified by `flow_history_id`.
    #[error("flow execution failed: {error:#}")]
    Execution {
        flow_history_id: Option<i64>,
        error: anyhow::Error,
    },
}

impl FlowyError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, FlowyError>;
