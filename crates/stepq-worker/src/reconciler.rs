use std::sync::Arc;

use async_trait::async_trait;
use stepq_queue::{JobInfo, Queue, Status};
use tracing::warn;

use crate::error::Result;

pub const CRASHED_MESSAGE: &str =
    "Job manager crashed while running this job (missing heartbeats).";
pub const EXCEEDED_DURATION_MESSAGE: &str =
    "Job manager was killed while running this job (job exceeded maximum duration).";

/// Moves jobs abandoned by a dead or killed worker to a terminal state.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// The job's worker stopped sending heartbeats.
    async fn set_crashed(&self, job: &JobInfo, message: &str) -> Result<()>;

    /// The job ran longer than allowed and its worker was stopped.
    async fn set_exceeded_maximum_duration(&self, job: &JobInfo, message: &str) -> Result<()>;
}

/// Marks the job as `error` in the queue.
///
/// Already finished jobs are left as they are, so racing with the original
/// worker's own report is harmless.
pub struct QueueReconciler {
    queue: Arc<Queue>,
}

impl QueueReconciler {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Reconciler for QueueReconciler {
    async fn set_crashed(&self, job: &JobInfo, message: &str) -> Result<()> {
        warn!(job_id = %job.job_id, dataset = %job.params.dataset, "{message}");
        self.queue.finish_job(&job.job_id, Status::Error)?;
        Ok(())
    }

    async fn set_exceeded_maximum_duration(&self, job: &JobInfo, message: &str) -> Result<()> {
        warn!(job_id = %job.job_id, dataset = %job.params.dataset, "{message}");
        self.queue.finish_job(&job.job_id, Status::Error)?;
        Ok(())
    }
}
