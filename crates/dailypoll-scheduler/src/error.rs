use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// `enqueue` was called with a zero or negative delay. Past-due targets
    /// are a caller contract violation, never retried.
    #[error("Non-positive delay for job {job_id}: {delay_secs}s")]
    NonPositiveDelay { job_id: String, delay_secs: i64 },

    /// The poll repository collaborator failed while listing future polls.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Job kind payload failed to serialise / deserialise.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A wall-clock computation produced no valid instant (e.g. a DST gap
    /// at local midnight).
    #[error("Invalid schedule time: {0}")]
    InvalidTime(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
