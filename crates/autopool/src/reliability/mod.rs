//! Retry strategies for jobs
//!
//! This module provides:
//! - [`RetryStrategy`] - Pluggable re-execution policy
//! - [`Fibonacci`] - Retry with Fibonacci-spaced backoff
//! - [`Retriable`] - A job wrapped in a strategy, itself a job

mod retry;

pub use retry::{fibonacci, Fibonacci, Retriable, RetryStrategy};
