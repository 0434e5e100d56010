//! The worker loop process: claim a job, publish it in the state file, run
//! it, report the outcome, repeat.

use std::sync::Arc;

use async_trait::async_trait;
use stepq_queue::{Job, JobInfo, Queue, QueueError, Status};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, WorkerError},
    periodic::Interval,
    state::{StateFile, WorkerState},
};

/// Executes one job and reports its terminal status.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobInfo) -> Status;
}

/// Runs `sh -c <command>` with the job identity in the environment.
///
/// Exit code 0 maps to `success`, anything else to `error`.
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn run(&self, job: &JobInfo) -> Status {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("STEPQ_JOB_ID", &job.job_id)
            .env("STEPQ_JOB_TYPE", &job.job_type)
            .env("STEPQ_JOB_DATASET", &job.params.dataset)
            .env("STEPQ_JOB_CONFIG", job.params.config.as_deref().unwrap_or_default())
            .env("STEPQ_JOB_SPLIT", job.params.split.as_deref().unwrap_or_default())
            .env("STEPQ_JOB_FORCE", if job.force { "1" } else { "0" })
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Status::Success,
            Ok(status) => {
                warn!(job_id = %job.job_id, exit = ?status.code(), "job command failed");
                Status::Error
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to launch job command");
                Status::Error
            }
        }
    }
}

pub struct WorkerLoop {
    queue: Arc<Queue>,
    runner: Arc<dyn JobRunner>,
    state_file: StateFile,
    job_types: Vec<String>,
    max_jobs_per_namespace: Option<i64>,
    sleep: Interval,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<Queue>,
        runner: Arc<dyn JobRunner>,
        state_file: StateFile,
        job_types: Vec<String>,
        max_jobs_per_namespace: Option<i64>,
        sleep: Interval,
    ) -> Self {
        Self {
            queue,
            runner,
            state_file,
            job_types,
            max_jobs_per_namespace,
            sleep,
        }
    }

    /// Write an idle snapshot so the supervisor has something to read.
    pub fn publish_idle(&self) -> Result<()> {
        self.state_file.write(&WorkerState::idle())
    }

    /// Claim and process at most one job, trying job types in order.
    ///
    /// Returns `Ok(false)` when every queue is empty. If `shutdown` fires
    /// while the job runs, the job is abandoned in the `started` state and
    /// left to the supervisor.
    pub async fn process_next_job(&self, shutdown: &CancellationToken) -> Result<bool> {
        for job_type in &self.job_types {
            match self.queue.start_job(job_type, self.max_jobs_per_namespace) {
                Ok(job) => {
                    self.process(job, shutdown).await?;
                    return Ok(true);
                }
                Err(QueueError::EmptyQueue) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Loop until `shutdown` is cancelled.
    ///
    /// Store failures are logged and retried after the idle back-off; state
    /// file failures end the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.job_types.is_empty() {
            return Err(WorkerError::Config(
                "worker.job_types must list at least one job type".to_string(),
            ));
        }
        info!(job_types = ?self.job_types, "worker loop started");

        while !shutdown.is_cancelled() {
            match self.process_next_job(&shutdown).await {
                Ok(true) => continue,
                Ok(false) => debug!("no job available, sleeping"),
                Err(WorkerError::Queue(e)) => error!(error = %e, "failed to claim a job"),
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.sleep.next_delay()) => {}
            }
        }

        info!("worker loop stopped");
        Ok(())
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) -> Result<()> {
        let info = job.info();
        self.state_file.write(&WorkerState::running(info.clone()))?;

        let status = tokio::select! {
            status = self.runner.run(&info) => status,
            _ = shutdown.cancelled() => {
                warn!(job_id = %info.job_id, "stopped while running a job");
                return Ok(());
            }
        };

        let finished = self.queue.finish_job(&info.job_id, status);
        self.state_file.write(&WorkerState::idle())?;
        finished?;
        Ok(())
    }
}
