//! Job trait definition

use std::sync::Arc;

/// Outcome of a single job execution
///
/// The success payload is an arbitrary JSON value so jobs of different
/// shapes can share one pool.
pub type JobResult = Result<serde_json::Value, JobError>;

/// Error type for job failures
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job itself reported a failure
    #[error("{0}")]
    Failed(String),

    /// Wrapped error from job code
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// The retry strategy ran out of attempts
    #[error("maximum retries reached after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Execution panicked; the worker survived
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The pool was cancelled before the job could run
    #[error("job was abandoned before execution")]
    Abandoned,
}

impl JobError {
    /// Create a plain failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether this error ends a retry chain
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

/// A unit of work that executes synchronously
///
/// Workers run `execute` on tokio's blocking pool, so an implementation may
/// block (sleep, do I/O) without stalling other workers.
///
/// # Example
///
/// ```
/// use autopool::{Job, JobResult};
/// use serde_json::json;
///
/// struct Resize {
///     width: u32,
/// }
///
/// impl Job for Resize {
///     fn execute(&self) -> JobResult {
///         Ok(json!({ "width": self.width }))
///     }
/// }
/// ```
pub trait Job: Send + Sync + 'static {
    /// Execute the job once
    fn execute(&self) -> JobResult;
}

impl<J: Job + ?Sized> Job for Box<J> {
    fn execute(&self) -> JobResult {
        (**self).execute()
    }
}

impl<J: Job + ?Sized> Job for Arc<J> {
    fn execute(&self) -> JobResult {
        (**self).execute()
    }
}

/// Job backed by a closure
pub struct FnJob<F> {
    f: F,
}

impl<F> Job for FnJob<F>
where
    F: Fn() -> JobResult + Send + Sync + 'static,
{
    fn execute(&self) -> JobResult {
        (self.f)()
    }
}

/// Turn a closure into a [`Job`]
///
/// ```
/// use autopool::{job_fn, Job};
///
/// let job = job_fn(|| Ok(serde_json::json!("done")));
/// assert!(job.execute().is_ok());
/// ```
pub fn job_fn<F>(f: F) -> FnJob<F>
where
    F: Fn() -> JobResult + Send + Sync + 'static,
{
    FnJob { f }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    impl Job for Echo {
        fn execute(&self) -> JobResult {
            Ok(json!(self.0))
        }
    }

    #[test]
    fn test_job_fn_executes_closure() {
        let job = job_fn(|| Ok(json!({"ok": true})));
        assert_eq!(job.execute().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_boxed_and_shared_jobs() {
        let boxed: Box<dyn Job> = Box::new(Echo("boxed"));
        assert_eq!(boxed.execute().unwrap(), json!("boxed"));

        let shared = Arc::new(Echo("shared"));
        assert_eq!(shared.execute().unwrap(), json!("shared"));
    }

    #[test]
    fn test_error_display() {
        let err = JobError::failed("disk full");
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_exhausted());

        let err = JobError::RetriesExhausted {
            attempts: 3,
            last_error: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "maximum retries reached after 3 attempts: timeout"
        );
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_from_anyhow() {
        let err: JobError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, JobError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
