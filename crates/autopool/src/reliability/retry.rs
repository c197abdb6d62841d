//! Retry strategy implementation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job::{Job, JobError, JobResult};

/// Strategy that re-executes a failing job
///
/// Strategies block the calling thread between attempts. Inside the pool
/// that thread belongs to one worker, so a retry chain occupies its worker
/// for the full backoff and retry duration.
pub trait RetryStrategy: Send + Sync + 'static {
    /// Execute `job`, retrying on failure until success or exhaustion
    fn run(&self, job: &dyn Job) -> JobResult;
}

/// The n-th Fibonacci number, from the closed form
///
/// `round((φⁿ − ψⁿ) / √5)` with `ψ = 1 − φ`: 0, 1, 1, 2, 3, 5, 8, …
pub fn fibonacci(n: u32) -> u64 {
    let sqrt5 = 5f64.sqrt();
    let phi = (1.0 + sqrt5) / 2.0;
    let psi = 1.0 - phi;
    let exp = n.min(i32::MAX as u32) as i32;
    let value = ((phi.powi(exp) - psi.powi(exp)) / sqrt5).round();
    if value >= u64::MAX as f64 {
        u64::MAX
    } else {
        value as u64
    }
}

/// Retry with Fibonacci-spaced backoff
///
/// The attempt index starts at 0 and is checked with "greater than", so
/// `max_attempts = n` allows `n + 1` executions. After the attempt with
/// index `i` fails the strategy sleeps `fibonacci(i) * unit`.
///
/// # Example
///
/// ```
/// use autopool::Fibonacci;
/// use std::time::Duration;
///
/// let strategy = Fibonacci::new(4).with_unit(Duration::from_millis(500));
///
/// assert_eq!(strategy.delay_for_attempt(0), Duration::ZERO);
/// assert_eq!(strategy.delay_for_attempt(3), Duration::from_secs(1));
/// assert_eq!(strategy.delay_for_attempt(4), Duration::from_millis(1500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fibonacci {
    /// Highest attempt index that may still execute
    pub max_attempts: u32,

    /// Length of one backoff step
    #[serde(with = "crate::duration_millis")]
    pub unit: Duration,
}

impl Default for Fibonacci {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Fibonacci {
    /// Create a strategy with one-second backoff steps
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            unit: Duration::from_secs(1),
        }
    }

    /// Set the length of one backoff step
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Delay slept after the attempt with index `attempt` fails
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let steps = u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX);
        self.unit.saturating_mul(steps)
    }

    fn exhausted(attempts: u32, last_error: String) -> JobResult {
        warn!(attempts, error = %last_error, "Retries exhausted");
        Err(JobError::RetriesExhausted {
            attempts,
            last_error,
        })
    }
}

impl RetryStrategy for Fibonacci {
    fn run(&self, job: &dyn Job) -> JobResult {
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            if attempt > self.max_attempts {
                return Self::exhausted(attempt, last_error);
            }

            match job.execute() {
                Ok(output) => return Ok(output),
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job attempt failed, backing off"
                    );
                    std::thread::sleep(delay);
                    last_error = error.to_string();
                }
            }

            attempt = match attempt.checked_add(1) {
                Some(next) => next,
                None => return Self::exhausted(attempt, last_error),
            };
        }
    }
}

/// A job that runs its inner job under a retry strategy
///
/// Implements [`Job`], so it can be submitted to a pool or wrapped again.
///
/// # Example
///
/// ```
/// use autopool::{job_fn, Job, Retriable};
/// use serde_json::json;
///
/// let job = Retriable::fibonacci(job_fn(|| Ok(json!("first try"))));
/// assert_eq!(job.execute().unwrap(), json!("first try"));
/// ```
pub struct Retriable<J, S = Fibonacci> {
    job: J,
    strategy: S,
}

impl<J: Job> Retriable<J> {
    /// Wrap a job with the default Fibonacci strategy (3 attempts, 1s steps)
    pub fn fibonacci(job: J) -> Self {
        Self::new(job, Fibonacci::default())
    }
}

impl<J: Job, S: RetryStrategy> Retriable<J, S> {
    /// Wrap a job with the given strategy
    pub fn new(job: J, strategy: S) -> Self {
        Self { job, strategy }
    }

    /// The strategy driving retries
    pub fn strategy(&self) -> &S {
        &self.strategy
    }
}

impl<J: Job, S: RetryStrategy> Job for Retriable<J, S> {
    fn execute(&self) -> JobResult {
        self.strategy.run(&self.job)
    }
}
