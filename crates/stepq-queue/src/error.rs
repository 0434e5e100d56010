use thiserror::Error;

use crate::types::Status;

/// Errors that can occur within the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No waiting job is eligible to start. Routine: callers back off and retry.
    #[error("No eligible job in the queue")]
    EmptyQueue,

    /// `finish_job` was called with a status that does not end a job.
    #[error("Status {0} is not a terminal status")]
    NotTerminal(Status),

    /// A stored row carries a status this build does not know.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// A stored timestamp could not be parsed.
    #[error("Invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;
