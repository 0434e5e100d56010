use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{QueueError, Result},
    store::JobStore,
    types::{Job, JobParams, Status, StatusCounts},
};

/// Job queue façade shared by producers, workers and the supervisor.
///
/// Operations that belong to one job type take it as an argument; heartbeat
/// and zombie scans work across all types.
pub struct Queue {
    store: JobStore,
}

impl Queue {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        Ok(Self {
            store: JobStore::new(conn)?,
        })
    }

    /// Open the shared queue database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Ok(Self {
            store: JobStore::open(path, busy_timeout)?,
        })
    }

    /// Enqueue a waiting job. Duplicates are accepted: several waiting jobs
    /// may share a unicity key.
    #[instrument(skip(self, params), fields(dataset = %params.dataset))]
    pub fn add_job(&self, job_type: &str, params: &JobParams, force: bool) -> Result<()> {
        let job = self.store.insert(job_type, params, force)?;
        debug!(job_id = %job.id, "job added");
        Ok(())
    }

    /// Claim the best eligible waiting job of `job_type`.
    ///
    /// Fails with [`QueueError::EmptyQueue`] when no waiting job is eligible,
    /// which includes the case where every waiting job is blocked by a
    /// started job with the same key or by the namespace limit.
    #[instrument(skip(self))]
    pub fn start_job(&self, job_type: &str, max_jobs_per_namespace: Option<i64>) -> Result<Job> {
        let job = self
            .store
            .claim_next(job_type, max_jobs_per_namespace)?
            .ok_or(QueueError::EmptyQueue)?;
        info!(
            job_id = %job.id,
            dataset = %job.params.dataset,
            config = ?job.params.config,
            split = ?job.params.split,
            "job started"
        );
        Ok(job)
    }

    /// Finish a started job with a terminal status.
    ///
    /// A job that is unknown or not started is left alone and only logged:
    /// late or duplicate reports are expected once the supervisor has
    /// reclaimed a zombie.
    #[instrument(skip(self))]
    pub fn finish_job(&self, job_id: &str, finished_status: Status) -> Result<()> {
        if self.store.finish(job_id, finished_status)? {
            info!("job finished");
            return Ok(());
        }
        match self.store.get(job_id)? {
            None => warn!("trying to finish an unknown job, ignoring"),
            Some(job) => warn!(
                status = %job.status,
                "trying to finish a job that is not started, ignoring"
            ),
        }
        Ok(())
    }

    /// Touch `last_heartbeat` of a started job. No-op for any other job.
    #[instrument(skip(self))]
    pub fn heartbeat(&self, job_id: &str) -> Result<()> {
        if !self.store.touch_heartbeat(job_id)? {
            debug!("heartbeat for a job that is not started, ignoring");
        }
        Ok(())
    }

    /// Started jobs, of any type, without a liveness signal for longer than
    /// `max_seconds_without_heartbeat`.
    pub fn get_zombies(&self, max_seconds_without_heartbeat: Duration) -> Result<Vec<Job>> {
        self.store.started_and_silent_for(max_seconds_without_heartbeat)
    }

    pub fn get_jobs_count_by_status(&self, job_type: &str) -> Result<StatusCounts> {
        self.store.counts_by_status(job_type)
    }

    /// Whether a job with this unicity key is waiting or started.
    pub fn is_job_in_process(&self, job_type: &str, params: &JobParams) -> Result<bool> {
        Ok(self.store.count_in_process(job_type, params)? > 0)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get(job_id)
    }

    /// Started jobs of `job_type`, oldest first.
    pub fn get_started_jobs(&self, job_type: &str) -> Result<Vec<Job>> {
        self.store.with_status(job_type, Status::Started)
    }
}
