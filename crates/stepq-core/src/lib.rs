//! Configuration and shared error types for the stepq crates.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, HealthConfig, QueueConfig, StepqConfig, WorkerConfig};
pub use error::{Result, StepqError};
