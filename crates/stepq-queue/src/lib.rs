//! Persistent job queue with fair, exclusive job claiming.
//!
//! # Overview
//!
//! Jobs are rows of a SQLite `queue_jobs` table shared by every worker
//! process. Producers call [`Queue::add_job`]; workers call
//! [`Queue::start_job`] to claim the best eligible waiting job and
//! [`Queue::finish_job`] when done; the supervisor keeps started jobs alive
//! with [`Queue::heartbeat`] and reclaims silent ones via
//! [`Queue::get_zombies`].
//!
//! # Guarantees
//!
//! | Guarantee | Enforced by |
//! |-----------|-------------|
//! | one started job per (type, dataset, config, split) | claim transaction + [`scheduler`] |
//! | at most N started jobs per namespace | claim transaction + [`scheduler`] |
//! | status only moves forward | `UPDATE … WHERE status = …` in [`store`] |
//! | late/duplicate finish reports are harmless | [`Queue::finish_job`] |

pub mod db;
pub mod error;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::{QueueError, Result};
pub use queue::Queue;
pub use types::{namespace_of, Job, JobInfo, JobParams, Status, StatusCounts};
