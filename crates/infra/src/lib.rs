//! Infrastructure layer: job persistence, the import queue runtime and its
//! configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
pub use jobs::{
    ImportFailure, ImportProcessor, ImportQueue, InMemoryJobStore, JobContext, JobStore,
    PostgresJobStore, QueueError, StoreError,
};
