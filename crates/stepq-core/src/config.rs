use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEALTH_HOST: &str = "localhost";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_MISSING_HEARTBEATS: u32 = 5;
pub const DEFAULT_MAX_JOB_DURATION_SECS: u64 = 20 * 60;
pub const DEFAULT_KILL_ZOMBIES_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_KILL_LONG_JOB_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SLEEP_SECS: u64 = 15;

/// Top-level config (stepq.toml + STEPQ_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepqConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Admission control shared by every `start_job` caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Cap on concurrently started jobs per namespace. `None` or <= 0 means unlimited.
    #[serde(default)]
    pub max_jobs_per_namespace: Option<i64>,
}

/// Worker loop and supervisor timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_max_missing_heartbeats")]
    pub max_missing_heartbeats: u32,
    #[serde(default = "default_max_job_duration")]
    pub max_job_duration_seconds: u64,
    #[serde(default = "default_kill_zombies_interval")]
    pub kill_zombies_interval_seconds: u64,
    #[serde(default = "default_kill_long_job_interval")]
    pub kill_long_job_interval_seconds: u64,
    /// Idle back-off of the worker loop when every queue is empty.
    #[serde(default = "default_sleep")]
    pub sleep_seconds: u64,
    /// Job types processed by the worker loop, tried in order.
    #[serde(default)]
    pub job_types: Vec<String>,
    /// Shell command run once per job by the worker loop.
    #[serde(default)]
    pub command: Option<String>,
    /// Where the worker loop publishes its state. Derived from the pid when unset.
    #[serde(default)]
    pub state_file_path: Option<PathBuf>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// Per-dataset multiplier applied to `max_job_duration_seconds`.
    #[serde(default)]
    pub duration_multipliers: HashMap<String, u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            max_missing_heartbeats: default_max_missing_heartbeats(),
            max_job_duration_seconds: default_max_job_duration(),
            kill_zombies_interval_seconds: default_kill_zombies_interval(),
            kill_long_job_interval_seconds: default_kill_long_job_interval(),
            sleep_seconds: default_sleep(),
            job_types: Vec::new(),
            command: None,
            state_file_path: None,
            startup_timeout_seconds: default_startup_timeout(),
            stop_timeout_seconds: default_stop_timeout(),
            duration_multipliers: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Staleness threshold after which a started job counts as a zombie.
    pub fn max_seconds_without_heartbeat(&self) -> Duration {
        Duration::from_secs(
            self.heartbeat_interval_seconds
                .saturating_mul(u64::from(self.max_missing_heartbeats)),
        )
    }

    /// Maximum wall-clock runtime for a job on `dataset`.
    pub fn max_job_duration_for(&self, dataset: &str) -> Duration {
        let multiplier = self
            .duration_multipliers
            .get(dataset)
            .copied()
            .unwrap_or(1);
        Duration::from_secs(self.max_job_duration_seconds.saturating_mul(u64::from(multiplier)))
    }

    pub fn resolved_state_file_path(&self) -> PathBuf {
        self.state_file_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("stepq-worker-state-{}.json", std::process::id()))
        })
    }
}

/// Health-check subprocess binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_health_startup_timeout")]
    pub startup_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: default_health_host(),
            port: default_health_port(),
            startup_timeout_seconds: default_health_startup_timeout(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.stepq/queue.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_max_missing_heartbeats() -> u32 {
    DEFAULT_MAX_MISSING_HEARTBEATS
}
fn default_max_job_duration() -> u64 {
    DEFAULT_MAX_JOB_DURATION_SECS
}
fn default_kill_zombies_interval() -> u64 {
    DEFAULT_KILL_ZOMBIES_INTERVAL_SECS
}
fn default_kill_long_job_interval() -> u64 {
    DEFAULT_KILL_LONG_JOB_INTERVAL_SECS
}
fn default_sleep() -> u64 {
    DEFAULT_SLEEP_SECS
}
fn default_startup_timeout() -> u64 {
    60
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_health_host() -> String {
    DEFAULT_HEALTH_HOST.to_string()
}
fn default_health_port() -> u16 {
    DEFAULT_HEALTH_PORT
}
fn default_health_startup_timeout() -> u64 {
    10
}

impl StepqConfig {
    /// Load config from a TOML file with STEPQ_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `STEPQ_CONFIG` env var
    ///   3. ~/.stepq/stepq.toml
    ///
    /// Nested env keys use a double underscore:
    /// `STEPQ_WORKER__MAX_MISSING_HEARTBEATS=3`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("STEPQ_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("STEPQ_").ignore(&["config"]).split("__"))
            .extract()
            .map_err(|e| crate::error::StepqError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.stepq/stepq.toml", home)
}
