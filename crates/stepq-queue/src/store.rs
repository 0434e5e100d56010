use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use crate::{
    db::{init_db, open},
    error::{QueueError, Result},
    scheduler::select_next,
    types::{Job, JobParams, Status, StatusCounts},
};

const JOB_COLUMNS: &str = "id, type, dataset, config, split, force, status,
     created_at, started_at, last_heartbeat, finished_at";

/// Durable job records behind atomic, conditionally applied updates.
///
/// Claimants live in separate processes, so nothing here relies on the
/// in-process `Mutex` for correctness: every mutation is either a single
/// `UPDATE … WHERE id = ? AND status = ?` or runs inside an IMMEDIATE
/// transaction, which holds SQLite's write lock across processes.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open(path, busy_timeout)?),
        })
    }

    pub fn insert(&self, job_type: &str, params: &JobParams, force: bool) -> Result<Job> {
        let now = now();
        let job = Job {
            id: Uuid::now_v7().to_string(),
            job_type: job_type.to_string(),
            params: params.clone(),
            force,
            status: Status::Waiting,
            created_at: now,
            started_at: None,
            last_heartbeat: None,
            finished_at: None,
        };

        self.conn().execute(
            "INSERT INTO queue_jobs
             (id, type, dataset, config, split, namespace, force, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'waiting', ?8)",
            rusqlite::params![
                job.id,
                job.job_type,
                job.params.dataset,
                job.params.config,
                job.params.split,
                job.namespace(),
                job.force,
                fmt_ts(now),
            ],
        )?;
        Ok(job)
    }

    /// Select and claim one waiting job of `job_type` in a single write
    /// transaction. `Ok(None)` when nothing is eligible.
    pub fn claim_next(
        &self,
        job_type: &str,
        max_jobs_per_namespace: Option<i64>,
    ) -> Result<Option<Job>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let waiting = query_jobs(
            &tx,
            "WHERE type = ?1 AND status = 'waiting' ORDER BY created_at, rowid",
            [job_type],
        )?;
        let started = query_jobs(&tx, "WHERE type = ?1 AND status = 'started'", [job_type])?;

        let Some(next) = select_next(&waiting, &started, max_jobs_per_namespace) else {
            // Dropping `tx` rolls back the read-only transaction.
            return Ok(None);
        };

        let now = now();
        let claimed = tx.execute(
            "UPDATE queue_jobs SET status = 'started', started_at = ?1
             WHERE id = ?2 AND status = 'waiting'",
            rusqlite::params![fmt_ts(now), next.id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        let mut job = next.clone();
        tx.commit()?;

        job.status = Status::Started;
        job.started_at = Some(now);
        Ok(Some(job))
    }

    /// Move a started job to `status`. Returns `false` when the job does not
    /// exist or is not started, leaving every row untouched.
    pub fn finish(&self, job_id: &str, status: Status) -> Result<bool> {
        if !status.is_terminal() {
            return Err(QueueError::NotTerminal(status));
        }
        let n = self.conn().execute(
            "UPDATE queue_jobs SET status = ?1, finished_at = ?2
             WHERE id = ?3 AND status = 'started'",
            rusqlite::params![status.as_str(), fmt_ts(now()), job_id],
        )?;
        Ok(n == 1)
    }

    /// Record a heartbeat on a started job. Returns `false` otherwise.
    pub fn touch_heartbeat(&self, job_id: &str) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE queue_jobs SET last_heartbeat = ?1
             WHERE id = ?2 AND status = 'started'",
            rusqlite::params![fmt_ts(now()), job_id],
        )?;
        Ok(n == 1)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let mut jobs = query_jobs(&conn, "WHERE id = ?1", [job_id])?;
        Ok(jobs.pop())
    }

    /// Jobs of `job_type` in `status`, oldest first.
    pub fn with_status(&self, job_type: &str, status: Status) -> Result<Vec<Job>> {
        let conn = self.conn();
        query_jobs(
            &conn,
            "WHERE type = ?1 AND status = ?2 ORDER BY created_at, rowid",
            [job_type, status.as_str()],
        )
    }

    /// Started jobs (any type) whose last liveness signal is older than
    /// `max_age` before now.
    pub fn started_and_silent_for(&self, max_age: Duration) -> Result<Vec<Job>> {
        let now = now();
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        let conn = self.conn();
        query_jobs(
            &conn,
            "WHERE status = 'started' AND COALESCE(last_heartbeat, started_at) < ?1
             ORDER BY created_at, rowid",
            [fmt_ts(cutoff)],
        )
    }

    /// Number of waiting or started jobs with this unicity key.
    pub fn count_in_process(&self, job_type: &str, params: &JobParams) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM queue_jobs
             WHERE type = ?1 AND dataset = ?2 AND config IS ?3 AND split IS ?4
               AND status IN ('waiting', 'started')",
            rusqlite::params![job_type, params.dataset, params.config, params.split],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn counts_by_status(&self, job_type: &str) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM queue_jobs WHERE type = ?1 GROUP BY status",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([job_type], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status: Status = status.parse().map_err(QueueError::InvalidStatus)?;
            counts.set(status, n as u64);
        }
        Ok(counts)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current time at the precision the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that string order equals time order in SQL.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::InvalidTimestamp {
            reason: e.to_string(),
            value,
        })
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_ts).transpose()
}

/// Columns of one `queue_jobs` row before validation.
struct RawJob {
    id: String,
    job_type: String,
    dataset: String,
    config: Option<String>,
    split: Option<String>,
    force: bool,
    status: String,
    created_at: String,
    started_at: Option<String>,
    last_heartbeat: Option<String>,
    finished_at: Option<String>,
}

impl RawJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_type: row.get(1)?,
            dataset: row.get(2)?,
            config: row.get(3)?,
            split: row.get(4)?,
            force: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            last_heartbeat: row.get(9)?,
            finished_at: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            params: JobParams {
                dataset: self.dataset,
                config: self.config,
                split: self.split,
            },
            force: self.force,
            status: self.status.parse().map_err(QueueError::InvalidStatus)?,
            created_at: parse_ts(self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            last_heartbeat: parse_opt_ts(self.last_heartbeat)?,
            finished_at: parse_opt_ts(self.finished_at)?,
        })
    }
}

fn query_jobs(conn: &Connection, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs {clause}"))?;
    let raw: Vec<RawJob> = stmt
        .query_map(params, RawJob::from_row)?
        .collect::<rusqlite::Result<_>>()?;
    raw.into_iter().map(RawJob::into_job).collect()
}
