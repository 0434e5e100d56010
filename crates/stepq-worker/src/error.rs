//! Error types for the stepq-worker crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::process::WorkerExit;

/// All errors that can originate from the worker loop and its supervisor.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The state file exists but cannot be parsed.
    #[error("Bad worker state at {}: {reason}", .path.display())]
    BadWorkerState { path: PathBuf, reason: String },

    /// A subprocess could not be spawned or exited before becoming ready.
    #[error("Failed to start {name}: {reason}")]
    Spawn { name: String, reason: String },

    /// A subprocess did not signal readiness in time.
    #[error("{name} not ready after {secs}s")]
    StartupTimeout { name: String, secs: u64 },

    /// The worker subprocess stopped without being asked to.
    #[error(
        "Worker crashed ({exit}){}",
        .job_id.as_deref().map(|id| format!(" when running job_id={id}")).unwrap_or_default()
    )]
    WorkerCrashed {
        exit: WorkerExit,
        job_id: Option<String>,
    },

    /// The supervisor stopped the worker because its job overran.
    #[error("Worker stopped: job_id={job_id} exceeded the maximum duration of {max_secs}s")]
    JobTimeout { job_id: String, max_secs: u64 },

    /// The worker is gone but its exit status could not be collected.
    #[error(
        "Lost the worker ({reason}){}",
        .job_id.as_deref().map(|id| format!(" when running job_id={id}")).unwrap_or_default()
    )]
    WorkerLost {
        reason: String,
        job_id: Option<String>,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] stepq_queue::QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, WorkerError>;
