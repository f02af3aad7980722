//! Background import queue with claim-by-conditional-update, bounded
//! concurrency, cooperative cancellation and a fixed retry budget.
//!
//! ## Design
//!
//! - Jobs move `queued -> running -> success | failed`, or back to `queued`
//!   while retries remain
//! - A job is claimed by one conditional status update; whoever sees one
//!   affected row owns the attempt
//! - Each claim bumps `attempt`; writes from an older attempt are rejected
//! - Checkpoints survive requeues so the next attempt can resume
//!
//! ## Components
//!
//! - `Job`, `JobLog`, `JobError`: persisted records
//! - `JobStore`: persistence seam (in-memory or Postgres)
//! - `ImportQueue`: poll loop, dispatch, settlement and operator API
//! - `ImportProcessor` / `JobContext`: the business hook and its handle

pub mod context;
pub mod error;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use context::{ImportProcessor, JobContext};
pub use error::{ImportFailure, QueueError};
pub use postgres::PostgresJobStore;
pub use queue::ImportQueue;
pub use store::{InMemoryJobStore, JobStats, JobStore, StoreError};
pub use types::{FailureDecision, Job, JobError, JobLog, RetryPolicy, Transition};
