//! `importq-core`: vocabulary shared by the import queue and its surfaces.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers and the closed sets of job states, import types and log levels.

pub mod error;
pub mod id;
pub mod status;

pub use error::DomainError;
pub use id::{JobId, SourceId, UserId};
pub use status::{ImportType, JobStatus, LogLevel};
