//! Job contract consumed by the pool
//!
//! This module provides:
//! - [`Job`] - The unit of work executed by a worker
//! - [`JobError`] - Failure outcomes, including retry exhaustion
//! - [`JobHandle`] - Awaitable result of a spawned job

mod definition;
mod handle;

pub use definition::{job_fn, FnJob, Job, JobError, JobResult};
pub use handle::JobHandle;
pub(crate) use handle::ResultSender;
