//! Worker pool and autoscaling
//!
//! This module provides:
//! - [`Pool`] - Dispatches submitted jobs to idle workers
//! - [`WorkerSnapshot`] - Point-in-time view of a long-lived worker
//! - [`Scaler`] - Grows and shrinks the pool from observed latency
//!
//! # Architecture
//!
//! ```text
//!  submit() ──► intake (rendezvous) ──► dispatch loop ◄── availability channel
//!                                            │                    ▲
//!                                            ▼                    │ advertise
//!                                  worker's one-shot slot ──► Worker ──┘
//!                                                               │
//!                                                  spawn_blocking(job.execute)
//!
//!  Scaler (every interval): sample mean latency ─► classify ─► grow / shrink / evict idle
//! ```
//!
//! # Example
//!
//! ```ignore
//! use autopool::{job_fn, Pool, Scaler, ScalerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let pool = Pool::new(&CancellationToken::new(), 4);
//! let scaler = Scaler::with_config(&pool, ScalerConfig::default())?.run();
//!
//! for i in 0..100 {
//!     pool.submit(job_fn(move || Ok(json!(i)))).await?;
//! }
//!
//! // Graceful shutdown: every accepted job finishes first
//! pool.shutdown().await?;
//! scaler.await?;
//! ```

mod pool;
mod scaler;
#[allow(clippy::module_inception)]
mod worker;

pub use pool::{Pool, PoolConfig, PoolError, PoolStatus, WeakPool};
pub use scaler::{Scaler, ScalerConfig, ScalerError, ScalerState, ScalingDecision};
pub use worker::{WorkerId, WorkerSnapshot, WorkerState};
