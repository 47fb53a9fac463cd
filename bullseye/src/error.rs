use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the orchestrator's public operations and by stages.
#[derive(Error, Debug)]
pub enum Error {
    /// A submission was rejected before any job was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the job's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stage could not produce its output; the job fails with this message.
    #[error("{stage} failed: {message}")]
    Stage {
        stage: &'static str,
        message: String,
    },

    #[error("{what} timed out after {}s", elapsed.as_secs())]
    Timeout { what: String, elapsed: Duration },

    /// The job's stop signal was observed. Not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
