use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the namespace and the rest of a dataset name.
pub const NAMESPACE_SEPARATOR: char = '/';

/// Lifecycle state of a job. Moves forward only:
/// `waiting -> started -> {success | error | cancelled | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Started,
    Success,
    Error,
    Cancelled,
    Skipped,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Waiting,
        Status::Started,
        Status::Success,
        Status::Error,
        Status::Cancelled,
        Status::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Waiting => "waiting",
            Status::Started => "started",
            Status::Success => "success",
            Status::Error => "error",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Waiting | Status::Started)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// The resource a job operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobParams {
    pub dataset: String,
    pub config: Option<String>,
    pub split: Option<String>,
}

impl JobParams {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            config: None,
            split: None,
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_split(mut self, split: impl Into<String>) -> Self {
        self.split = Some(split.into());
        self
    }

    /// Tenant grouping used for admission control.
    pub fn namespace(&self) -> &str {
        namespace_of(&self.dataset)
    }
}

/// Everything up to the first `/`, or the whole name when there is none.
pub fn namespace_of(dataset: &str) -> &str {
    dataset
        .split_once(NAMESPACE_SEPARATOR)
        .map_or(dataset, |(namespace, _)| namespace)
}

/// Identity of a job as handed to workers and reconcilers.
///
/// This is also what the worker loop publishes in its state file, so the
/// field names are part of that file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub params: JobParams,
    pub force: bool,
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v7 string, primary key. Sorts with creation time.
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub params: JobParams,
    /// Stored and returned, never used for ranking.
    pub force: bool,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            params: self.params.clone(),
            force: self.force,
        }
    }

    pub fn namespace(&self) -> &str {
        self.params.namespace()
    }

    /// Most recent liveness signal of a started job.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.started_at)
    }
}

/// Per-status job counts for one job type. Always carries all six statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: u64,
    pub started: u64,
    pub success: u64,
    pub error: u64,
    pub cancelled: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Waiting => self.waiting,
            Status::Started => self.started,
            Status::Success => self.success,
            Status::Error => self.error,
            Status::Cancelled => self.cancelled,
            Status::Skipped => self.skipped,
        }
    }

    pub(crate) fn set(&mut self, status: Status, count: u64) {
        let slot = match status {
            Status::Waiting => &mut self.waiting,
            Status::Started => &mut self.started,
            Status::Success => &mut self.success,
            Status::Error => &mut self.error,
            Status::Cancelled => &mut self.cancelled,
            Status::Skipped => &mut self.skipped,
        };
        *slot = count;
    }

    pub fn total(&self) -> u64 {
        Status::ALL.iter().map(|s| self.get(*s)).sum()
    }
}
