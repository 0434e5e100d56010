//! `stepq-worker`: the worker loop and the supervisor that keeps it honest.
//!
//! The supervisor ([`WorkerExecutor`]) spawns one worker loop process and one
//! health-check process. The worker loop publishes what it is doing through a
//! [`StateFile`]; the supervisor reads that file to send heartbeats for the
//! current job and to stop jobs that run too long. Jobs whose worker died are
//! handed to a [`Reconciler`].

pub mod error;
pub mod executor;
pub mod health;
pub mod periodic;
pub mod process;
pub mod reconciler;
pub mod shutdown;
pub mod state;
pub mod worker_loop;

pub use error::{Result, WorkerError};
pub use executor::{ProcessSpec, WorkerExecutor};
pub use periodic::Interval;
pub use process::{ManagedProcess, WorkerExit};
pub use reconciler::{QueueReconciler, Reconciler, CRASHED_MESSAGE, EXCEEDED_DURATION_MESSAGE};
pub use shutdown::install_shutdown_handler;
pub use state::{StateFile, WorkerState};
pub use worker_loop::{CommandRunner, JobRunner, WorkerLoop};
