use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type.
///
/// Per-job failures (`DriverTimeout`, `DriverError`, `ArtifactIo`) never
/// abort a batch run: the scheduler converts them into measurements. The
/// remaining variants surface through the CLI or the HTTP API.
#[derive(Debug, Error)]
pub enum PumpkinError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    #[error("database error: {0}")]
    Storage(String),

    #[error("artifact directory already exists: {0}")]
    ArtifactConflict(String),

    #[error("artifact I/O error: {0}")]
    ArtifactIo(#[from] std::io::Error),

    #[error("browser driver timed out after {0:?}")]
    DriverTimeout(Duration),

    #[error("browser driver error: {0}")]
    DriverError(String),

    #[error("run {0} does not exist")]
    RunMissing(i64),

    #[error("ingest failed permanently: {0}")]
    IngestPersistent(String),

    #[error("run aborted: {0}")]
    RunAborted(String),

    #[error("invalid run status transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl PumpkinError {
    /// True for failures that are scoped to a single URL test and must not
    /// terminate the surrounding batch run.
    pub fn is_job_scoped(&self) -> bool {
        matches!(
            self,
            PumpkinError::DriverTimeout(_)
                | PumpkinError::DriverError(_)
                | PumpkinError::ArtifactIo(_)
                | PumpkinError::ArtifactConflict(_)
                | PumpkinError::IngestPersistent(_)
        )
    }

    /// Short message safe to expose to API clients. Internal detail stays in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            PumpkinError::BadRequest(msg) => msg.clone(),
            PumpkinError::NotFound(what) => format!("{what} not found"),
            PumpkinError::DatabaseUnavailable(_) => "database unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

/// Classifies sqlx errors that warrant one transparent reconnect attempt.
pub fn is_connection_class(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

impl From<sqlx::Error> for PumpkinError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PumpkinError::NotFound("row".to_string()),
            ref e if is_connection_class(e) => PumpkinError::DatabaseUnavailable(err.to_string()),
            other => PumpkinError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PumpkinError {
    fn from(err: serde_json::Error) -> Self {
        PumpkinError::Storage(format!("serialization: {err}"))
    }
}
