//! Supervised child processes with readiness checks and an idempotent
//! two-step stop (SIGTERM, then SIGKILL).

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};

const READY_POLL: Duration = Duration::from_millis(100);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    Failed { code: i32 },
    Signaled { signal: i32 },
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => WorkerExit::Success,
            (Some(code), _) => WorkerExit::Failed { code },
            (None, Some(signal)) => WorkerExit::Signaled { signal },
            (None, None) => WorkerExit::Failed { code: -1 },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Success)
    }

    /// Status to exit with when passing this exit on, using the shell's
    /// `128 + signal` convention for signals.
    pub fn exit_code(&self) -> i32 {
        match *self {
            WorkerExit::Success => 0,
            WorkerExit::Failed { code } => code,
            WorkerExit::Signaled { signal } => 128 + signal,
        }
    }

    /// SIGKILL from outside the supervisor almost always means the kernel
    /// OOM killer.
    pub fn is_oom(&self) -> bool {
        matches!(self, WorkerExit::Signaled { signal } if *signal == libc::SIGKILL)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Success => write!(f, "exit code 0"),
            WorkerExit::Failed { code } => write!(f, "exit code {code}"),
            WorkerExit::Signaled { signal } if self.is_oom() => {
                write!(f, "signal {signal} SIGKILL - surely an OOM")
            }
            WorkerExit::Signaled { signal } => write!(f, "signal {signal}"),
        }
    }
}

pub struct ManagedProcess {
    name: String,
    child: Child,
    exit: Option<WorkerExit>,
    stop_timeout: Duration,
}

impl ManagedProcess {
    /// Spawn `command`. The child is killed if the handle is dropped.
    pub fn spawn(name: &str, mut command: Command, stop_timeout: Duration) -> Result<Self> {
        let child = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        info!(process = name, pid = ?child.id(), "process spawned");
        Ok(Self {
            name: name.to_string(),
            child,
            exit: None,
            stop_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the child prints `banner` as a full line on stdout.
    ///
    /// The command must have been spawned with `stdout(Stdio::piped())`.
    /// Output after the banner keeps being drained into the log.
    pub async fn wait_for_banner(&mut self, banner: &str, timeout: Duration) -> Result<()> {
        let stdout = self.child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            name: self.name.clone(),
            reason: "stdout is not piped".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let scan = async {
            while let Some(line) = lines.next_line().await? {
                if line.trim_end() == banner {
                    return Ok(true);
                }
                debug!(process = %self.name, "{line}");
            }
            Ok::<_, std::io::Error>(false)
        };

        let outcome = tokio::time::timeout(timeout, scan).await;
        match outcome {
            Ok(Ok(true)) => {
                let name = self.name.clone();
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(process = %name, "{line}");
                    }
                });
                info!(process = %self.name, "process ready");
                Ok(())
            }
            Ok(Ok(false)) => Err(WorkerError::Spawn {
                name: self.name.clone(),
                reason: "exited before printing its readiness banner".to_string(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(WorkerError::StartupTimeout {
                name: self.name.clone(),
                secs: timeout.as_secs(),
            }),
        }
    }

    /// Wait until `host:port` accepts TCP connections.
    pub async fn wait_for_port(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if TcpStream::connect((host, port)).await.is_ok() {
                info!(process = %self.name, %host, port, "process accepting connections");
                return Ok(());
            }
            if !self.is_running() {
                return Err(WorkerError::Spawn {
                    name: self.name.clone(),
                    reason: format!("exited before listening on {host}:{port}"),
                });
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::StartupTimeout {
                    name: self.name.clone(),
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Non-blocking liveness check. Records the exit status once observed.
    pub fn is_running(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.exit = Some(WorkerExit::from_status(status));
                false
            }
            Err(e) => {
                warn!(process = %self.name, error = %e, "failed to poll process");
                false
            }
        }
    }

    /// Exit classification, if the process is known to have stopped.
    pub fn exit(&self) -> Option<WorkerExit> {
        self.exit
    }

    /// Stop the process: SIGTERM, wait up to the stop timeout, then SIGKILL.
    ///
    /// Stopping an already stopped process just returns its exit.
    pub async fn stop(&mut self) -> Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if let Some(status) = self.child.try_wait()? {
            return Ok(self.record(status));
        }

        if let Some(pid) = self.child.id() {
            // Safety: `pid` is our direct child and has not been reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let status = match tokio::time::timeout(self.stop_timeout, self.child.wait()).await {
            Ok(status) => status?,
            Err(_elapsed) => {
                warn!(
                    process = %self.name,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "process ignored SIGTERM, killing"
                );
                self.child.kill().await?;
                self.child.wait().await?
            }
        };
        let exit = self.record(status);
        info!(process = %self.name, %exit, "process stopped");
        Ok(exit)
    }

    fn record(&mut self, status: ExitStatus) -> WorkerExit {
        let exit = WorkerExit::from_status(status);
        self.exit = Some(exit);
        exit
    }
}
