//! Awaitable job results

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{JobError, JobResult};

pub(crate) type ResultSender = oneshot::Sender<JobResult>;

/// Single-assignment handle to the result of a job spawned on the pool
///
/// Resolves once the job has finished executing (including any retries).
/// If the pool drops the job without running it, the handle resolves to
/// [`JobError::Abandoned`].
///
/// # Example
///
/// ```ignore
/// let handle = pool.spawn(job_fn(|| Ok(json!(42)))).await?;
/// assert_eq!(handle.await?, json!(42));
/// ```
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub(crate) fn channel() -> (ResultSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Return the result if the job already finished
    pub fn try_result(&mut self) -> Option<JobResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(JobError::Abandoned)),
        }
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(JobError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_resolves_with_result() {
        let (tx, handle) = JobHandle::channel();
        tx.send(Ok(json!("done"))).unwrap();
        assert_eq!(handle.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_abandoned() {
        let (tx, handle) = JobHandle::channel();
        drop(tx);
        assert!(matches!(handle.await, Err(JobError::Abandoned)));
    }

    #[test]
    fn test_try_result_pending_then_ready() {
        let (tx, mut handle) = JobHandle::channel();
        assert!(handle.try_result().is_none());
        tx.send(Err(JobError::failed("nope"))).unwrap();
        assert!(matches!(handle.try_result(), Some(Err(JobError::Failed(_)))));
    }
}
