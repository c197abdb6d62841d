//! # Autopool
//!
//! A self-scaling worker pool: long-lived workers pull jobs from a queue,
//! execute them and report latency, and a scaler grows or shrinks the pool
//! to match load.
//!
//! ## Features
//!
//! - **Backpressured submission**: `submit` returns once the dispatch loop has taken the job
//! - **Graceful drain**: workers finish their current job before stopping
//! - **Shutdown completeness**: `shutdown` returns only after every accepted job finished
//! - **Fibonacci retries**: wrap any job in a retry strategy, the result is again a job
//! - **Hysteresis scaling**: sustained latency trends accelerate scaling, reversals dampen it
//!
//! ## Example
//!
//! ```ignore
//! use autopool::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = Pool::new(&CancellationToken::new(), 4);
//! Scaler::new(&pool).run();
//!
//! let flaky = Retriable::new(MyUpload::new(), Fibonacci::new(2));
//! let handle = pool.spawn(flaky).await?;
//!
//! match handle.await {
//!     Ok(output) => println!("uploaded: {output}"),
//!     Err(JobError::RetriesExhausted { attempts, .. }) => println!("gave up after {attempts}"),
//!     Err(e) => println!("failed: {e}"),
//! }
//!
//! pool.shutdown().await?;
//! ```

mod duration_millis;
pub mod job;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::job::{job_fn, Job, JobError, JobHandle, JobResult};
    pub use crate::reliability::{Fibonacci, Retriable, RetryStrategy};
    pub use crate::worker::{Pool, PoolConfig, PoolError, Scaler, ScalerConfig};
}

// Re-export key types at crate root
pub use job::{job_fn, FnJob, Job, JobError, JobHandle, JobResult};
pub use reliability::{fibonacci, Fibonacci, Retriable, RetryStrategy};
pub use worker::{
    Pool, PoolConfig, PoolError, PoolStatus, Scaler, ScalerConfig, ScalerError, ScalerState,
    ScalingDecision, WeakPool, WorkerId, WorkerSnapshot, WorkerState,
};
