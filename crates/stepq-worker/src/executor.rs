//! Worker supervisor: keeps one worker loop and one health-check process
//! alive, relays the worker's liveness to the queue, and terminates jobs
//! that overrun.
//!
//! Lifecycle:
//! - **starting**: spawn the worker loop and wait for its readiness banner
//!   (the state file path on stdout), then spawn the health-check server and
//!   wait until it accepts connections;
//! - **running**: heartbeat, kill_zombies and kill_long_job run on their own
//!   schedules while the liveness poll watches the worker;
//! - **stopping**: on shutdown or once the worker is gone, stop both
//!   processes. A worker that stopped on its own with a non-zero status is
//!   reported as [`WorkerError::WorkerCrashed`]; one stopped by kill_long_job
//!   as [`WorkerError::JobTimeout`], whatever its status.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stepq_core::{HealthConfig, WorkerConfig};
use stepq_queue::{JobInfo, Queue};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{Result, WorkerError},
    periodic::{every, Interval},
    process::ManagedProcess,
    reconciler::{Reconciler, CRASHED_MESSAGE, EXCEEDED_DURATION_MESSAGE},
    state::StateFile,
};

const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Program and arguments of a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

pub struct WorkerExecutor {
    queue: Arc<Queue>,
    reconciler: Arc<dyn Reconciler>,
    state_file: StateFile,
    config: WorkerConfig,
    health: HealthConfig,
    worker_spec: ProcessSpec,
    health_spec: ProcessSpec,
    worker: Mutex<Option<ManagedProcess>>,
    health_check: Mutex<Option<ManagedProcess>>,
    // set by kill_long_job while it holds the worker lock
    timed_out: Mutex<Option<(String, u64)>>,
}

impl WorkerExecutor {
    pub fn new(
        queue: Arc<Queue>,
        reconciler: Arc<dyn Reconciler>,
        state_file: StateFile,
        config: WorkerConfig,
        health: HealthConfig,
        worker_spec: ProcessSpec,
        health_spec: ProcessSpec,
    ) -> Self {
        Self {
            queue,
            reconciler,
            state_file,
            config,
            health,
            worker_spec,
            health_spec,
            worker: Mutex::new(None),
            health_check: Mutex::new(None),
            timed_out: Mutex::new(None),
        }
    }

    /// Launch both subprocesses, blocking until each one is ready.
    pub async fn start(&self) -> Result<()> {
        let stop_timeout = Duration::from_secs(self.config.stop_timeout_seconds);

        let mut command = self.worker_spec.command();
        command.stdout(Stdio::piped());
        let mut worker = ManagedProcess::spawn("worker loop", command, stop_timeout)?;
        let banner = self.state_file.path().display().to_string();
        let startup = Duration::from_secs(self.config.startup_timeout_seconds);
        if let Err(e) = worker.wait_for_banner(&banner, startup).await {
            let _ = worker.stop().await;
            return Err(e);
        }
        *self.worker.lock().await = Some(worker);

        info!("starting health-check server");
        let mut health = ManagedProcess::spawn("health check", self.health_spec.command(), stop_timeout)?;
        let startup = Duration::from_secs(self.health.startup_timeout_seconds);
        if let Err(e) = health
            .wait_for_port(&self.health.host, self.health.port, startup)
            .await
        {
            let _ = health.stop().await;
            self.stop().await;
            return Err(e);
        }
        *self.health_check.lock().await = Some(health);
        Ok(())
    }

    /// Start, then supervise until `shutdown` is cancelled or the worker
    /// stops. Returns an error if the worker crashed.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;

        let tasks = shutdown.child_token();
        info!("starting heartbeat");
        let handles = vec![
            {
                let this = Arc::clone(&self);
                let interval = Interval::Fixed(Duration::from_secs(self.config.heartbeat_interval_seconds));
                tokio::spawn(every("heartbeat", interval, tasks.clone(), move || {
                    let this = Arc::clone(&this);
                    async move { this.heartbeat() }
                }))
            },
            {
                let this = Arc::clone(&self);
                let interval =
                    Interval::around(Duration::from_secs(self.config.kill_zombies_interval_seconds));
                tokio::spawn(every("kill_zombies", interval, tasks.clone(), move || {
                    let this = Arc::clone(&this);
                    async move { this.kill_zombies().await }
                }))
            },
            {
                let this = Arc::clone(&self);
                let interval =
                    Interval::around(Duration::from_secs(self.config.kill_long_job_interval_seconds));
                tokio::spawn(every("kill_long_job", interval, tasks.clone(), move || {
                    let this = Arc::clone(&this);
                    async move { this.kill_long_job().await }
                }))
            },
        ];

        let result = self.watch_worker(&shutdown).await;

        tasks.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        self.stop().await;
        info!("executor loop finished");
        result
    }

    /// Stop both subprocesses. Safe to call any number of times.
    pub async fn stop(&self) {
        for slot in [&self.worker, &self.health_check] {
            if let Some(process) = slot.lock().await.as_mut() {
                if let Err(e) = process.stop().await {
                    warn!(process = process.name(), error = %e, "failed to stop process");
                }
            }
        }
    }

    async fn watch_worker(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("executor received SIGTERM");
                    return Ok(());
                }
                _ = tokio::time::sleep(LIVENESS_POLL) => {}
            }
            if !self.is_worker_alive().await? {
                return Ok(());
            }
        }
    }

    /// `Ok(true)` while the worker runs and `Ok(false)` once it exited
    /// cleanly on its own. A worker stopped by kill_long_job is a
    /// `JobTimeout`. Any other exit is `WorkerCrashed`, after handing the
    /// worker's current job to the reconciler.
    pub async fn is_worker_alive(&self) -> Result<bool> {
        let stopped = {
            let mut guard = self.worker.lock().await;
            let Some(worker) = guard.as_mut() else {
                return Ok(false);
            };
            if worker.is_running() {
                return Ok(true);
            }
            worker.stop().await
        };
        let exit = match stopped {
            Ok(exit) => exit,
            Err(e) => return Err(self.worker_lost(e)),
        };

        if let Some((job_id, max_secs)) = self.timed_out.lock().await.clone() {
            error!(%exit, %job_id, max_secs, "worker stopped, job exceeded maximum duration");
            return Err(WorkerError::JobTimeout { job_id, max_secs });
        }
        if exit.is_success() {
            info!("worker loop exited");
            return Ok(false);
        }
        let job = self.current_job();
        let job_id = job.as_ref().map(|job| job.job_id.clone());
        error!(%exit, oom = exit.is_oom(), job_id = ?job_id, "worker crashed");
        if let Some(job) = &job {
            if let Err(e) = self.reconciler.set_crashed(job, CRASHED_MESSAGE).await {
                warn!(job_id = %job.job_id, error = %e, "failed to reconcile the crashed job");
            }
        }
        Err(WorkerError::WorkerCrashed { exit, job_id })
    }

    fn worker_lost(&self, cause: WorkerError) -> WorkerError {
        let job_id = self.current_job().map(|job| job.job_id);
        error!(error = %cause, job_id = ?job_id, "worker is gone, exit status unknown");
        WorkerError::WorkerLost {
            reason: cause.to_string(),
            job_id,
        }
    }

    /// Relay the worker's current job to the queue as a heartbeat.
    ///
    /// Queue failures are only logged: the job may be finishing right now.
    pub fn heartbeat(&self) -> Result<()> {
        let Some(state) = self.state_file.read()? else {
            return Ok(());
        };
        if let Some(job_id) = state.job_id() {
            if let Err(e) = self.queue.heartbeat(job_id) {
                warn!(job_id, error = %e, "heartbeat failed, the job may be finishing");
            }
        }
        Ok(())
    }

    /// Mark every job whose worker stopped heartbeating as crashed.
    pub async fn kill_zombies(&self) -> Result<()> {
        let zombies = self
            .queue
            .get_zombies(self.config.max_seconds_without_heartbeat())?;
        for zombie in zombies {
            let job = zombie.info();
            match self.reconciler.set_crashed(&job, CRASHED_MESSAGE).await {
                Ok(()) => info!(job_id = %job.job_id, dataset = %job.params.dataset, "killed zombie"),
                Err(e) => warn!(job_id = %job.job_id, error = %e, "failed to reconcile zombie"),
            }
        }
        Ok(())
    }

    /// Stop the worker if its current job exceeded the maximum duration,
    /// then mark the job accordingly.
    pub async fn kill_long_job(&self) -> Result<()> {
        let Some(state) = self.state_file.read()? else {
            return Ok(());
        };
        let Some(job) = state.current_job_info else {
            return Ok(());
        };

        let max_duration = self.config.max_job_duration_for(&job.params.dataset);
        let running_for = (Utc::now() - state.last_updated).to_std().unwrap_or_default();
        if running_for < max_duration {
            return Ok(());
        }

        warn!(
            job_id = %job.job_id,
            dataset = %job.params.dataset,
            max_secs = max_duration.as_secs(),
            running_secs = running_for.as_secs(),
            "job exceeded maximum duration"
        );
        // The worker must be gone before the job is released.
        {
            let mut worker = self.worker.lock().await;
            *self.timed_out.lock().await = Some((job.job_id.clone(), max_duration.as_secs()));
            if let Some(worker) = worker.as_mut() {
                if let Err(e) = worker.stop().await {
                    warn!(error = %e, "failed to stop worker loop");
                }
            }
        }
        info!(job_id = %job.job_id, "killing a long job");
        self.reconciler
            .set_exceeded_maximum_duration(&job, EXCEEDED_DURATION_MESSAGE)
            .await
    }

    fn current_job(&self) -> Option<JobInfo> {
        match self.state_file.read() {
            Ok(state) => state.and_then(|s| s.current_job_info),
            Err(e) => {
                warn!(error = %e, "cannot read worker state");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reconciler::QueueReconciler, state::WorkerState};
    use stepq_queue::JobParams;

    fn executor(dir: &std::path::Path) -> WorkerExecutor {
        let queue = Arc::new(Queue::open(dir.join("queue.db"), Duration::from_secs(5)).unwrap());
        WorkerExecutor::new(
            Arc::clone(&queue),
            Arc::new(QueueReconciler::new(queue)),
            StateFile::new(dir.join("state.json")),
            WorkerConfig::default(),
            HealthConfig::default(),
            ProcessSpec::new("true"),
            ProcessSpec::new("true"),
        )
    }

    #[test]
    fn lost_worker_is_classified_with_its_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let job = JobInfo {
            job_id: "job-7".to_string(),
            job_type: "parquet".to_string(),
            params: JobParams::new("user/ds"),
            force: false,
        };
        executor.state_file.write(&WorkerState::running(job)).unwrap();

        let cause = WorkerError::Io(std::io::Error::other("wait failed"));
        match executor.worker_lost(cause) {
            WorkerError::WorkerLost { reason, job_id } => {
                assert!(reason.contains("wait failed"));
                assert_eq!(job_id.as_deref(), Some("job-7"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lost_idle_worker_has_no_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        let err = executor.worker_lost(WorkerError::Io(std::io::Error::other("wait failed")));
        assert_eq!(err.to_string(), "Lost the worker (I/O error: wait failed)");
    }
}
