//! State file shared by one worker loop (writer) and its supervisor (reader).
//!
//! The worker overwrites a single JSON document
//! `{"current_job_info": {...} | null, "last_updated": "<RFC 3339>"}`.
//! Both sides hold an exclusive `flock` on the sibling `<path>.lock` file
//! around every read and write, so a reader never sees a torn write.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepq_queue::JobInfo;

use crate::error::{Result, WorkerError};

/// Snapshot published by the worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    /// The job being processed, `None` while idle.
    #[serde(default)]
    pub current_job_info: Option<JobInfo>,
    /// When the snapshot was taken. Set when a job starts, so it doubles as
    /// the job's start time for the long-job check.
    pub last_updated: DateTime<Utc>,
}

impl WorkerState {
    pub fn idle() -> Self {
        Self {
            current_job_info: None,
            last_updated: Utc::now(),
        }
    }

    pub fn running(job: JobInfo) -> Self {
        Self {
            current_job_info: Some(job),
            last_updated: Utc::now(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.current_job_info.as_ref().map(|job| job.job_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current snapshot. A missing file means "no state yet".
    pub fn read(&self) -> Result<Option<WorkerState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let _lock = FileLock::acquire(&self.lock_path)?;
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WorkerError::BadWorkerState {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Replace the snapshot.
    pub fn write(&self, state: &WorkerState) -> Result<()> {
        let json = serde_json::to_vec(state).map_err(io::Error::other)?;
        let _lock = FileLock::acquire(&self.lock_path)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Delete the state file and its lock file. Missing files are fine.
    pub fn remove(&self) -> Result<()> {
        for path in [&self.path, &self.lock_path] {
            match std::fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Exclusive advisory lock, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        loop {
            // Safety: the descriptor is owned by `file` and open.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Safety: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
