//! Long-lived execution unit
//!
//! A worker repeatedly advertises a fresh single-slot channel on the pool's
//! availability channel, waits for one assignment, executes it on the
//! blocking pool and records timing.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, trace, warn};

use crate::job::{Job, JobError, JobResult, ResultSender};

/// Worker identifier, unique within one pool
pub type WorkerId = u64;

/// One unit of accepted work on its way to a worker
pub(crate) struct Assignment {
    pub(crate) job: Box<dyn Job>,
    pub(crate) reply: Option<ResultSender>,
    /// Released after execution, or when the assignment is dropped unexecuted
    pub(crate) work: TaskTrackerToken,
}

/// A worker's private channel for a single assignment
pub(crate) type Slot = oneshot::Sender<Assignment>;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Advertised and waiting for an assignment
    Idle,
    /// Executing an assignment
    Busy,
    /// Executing its last assignment before stopping
    Draining,
    /// Exited permanently
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Point-in-time view of one worker, as returned by [`Pool::workers`]
///
/// [`Pool::workers`]: super::Pool::workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    /// Time since the worker last finished a job, or since it started
    pub idle_for: Duration,
    /// Duration of the last execution, `None` before the first one
    pub last_duration: Option<Duration>,
}

/// State shared between a worker handle and its task
struct Shared {
    state: watch::Sender<WorkerState>,
    last_use: Mutex<Instant>,
    /// Nanoseconds of the last execution, 0 until the first one finishes
    last_duration: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}

/// Handle to a running worker
///
/// Owned by the pool's worker collection. Dropping the handle does not stop
/// the worker; call [`Worker::drain`] or cancel the pool.
pub(crate) struct Worker {
    id: WorkerId,
    shared: Arc<Shared>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Start a worker that advertises on `available`
    ///
    /// The worker stops when `parent` is cancelled or when it is drained.
    pub(crate) fn spawn(
        id: WorkerId,
        available: mpsc::Sender<Slot>,
        parent: &CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        let shared = Arc::new(Shared {
            state,
            last_use: Mutex::new(Instant::now()),
            last_duration: AtomicU64::new(0),
        });
        let stop = parent.child_token();

        let task = WorkerLoop {
            id,
            shared: Arc::clone(&shared),
            stop: stop.clone(),
            available,
        };
        let handle = tokio::spawn(task.run());

        debug!(worker_id = id, "Worker started");

        Self {
            id,
            shared,
            stop,
            handle,
        }
    }

    /// Worker ID
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Current lifecycle state
    pub(crate) fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// When the worker last finished a job (or was created)
    pub(crate) fn last_use(&self) -> Instant {
        *self.shared.last_use.lock()
    }

    /// Time since the worker was last used
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_use().elapsed()
    }

    /// Duration of the last execution in nanoseconds, 0 if none yet
    pub(crate) fn last_duration_nanos(&self) -> u64 {
        self.shared.last_duration.load(Ordering::Relaxed)
    }

    /// Duration of the last execution, if any
    pub(crate) fn last_duration(&self) -> Option<Duration> {
        match self.last_duration_nanos() {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Whether the worker was told to stop
    #[cfg(test)]
    pub(crate) fn is_draining(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Finish the current job, if any, then stop
    ///
    /// Does not interrupt an in-flight execution. An idle worker stops
    /// without taking further work.
    pub(crate) fn drain(&self) {
        self.stop.cancel();
        self.shared.state.send_if_modified(|state| {
            if *state == WorkerState::Busy {
                *state = WorkerState::Draining;
                true
            } else {
                false
            }
        });
        debug!(worker_id = self.id, "Worker draining");
    }

    /// Wait until the worker has exited
    #[cfg(test)]
    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|state| *state == WorkerState::Stopped).await;
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            state: self.state(),
            idle_for: self.idle_for(),
            last_duration: self.last_duration(),
        }
    }

    pub(crate) fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("last_duration_nanos", &self.last_duration_nanos())
            .finish()
    }
}

struct WorkerLoop {
    id: WorkerId,
    shared: Arc<Shared>,
    stop: CancellationToken,
    available: mpsc::Sender<Slot>,
}

impl WorkerLoop {
    async fn run(self) {
        loop {
            self.shared.set_state(WorkerState::Idle);

            let (slot, mut rx) = oneshot::channel();
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                sent = self.available.send(slot) => {
                    if sent.is_err() {
                        debug!(worker_id = self.id, "Dispatcher gone");
                        break;
                    }
                }
            }

            let assignment = tokio::select! {
                biased;
                received = &mut rx => match received {
                    Ok(assignment) => assignment,
                    // Slot dropped unused, advertise again
                    Err(_) => continue,
                },
                _ = self.stop.cancelled() => {
                    // A job placed in the slot before the close must still run
                    rx.close();
                    if let Ok(assignment) = rx.try_recv() {
                        self.execute(assignment).await;
                    }
                    break;
                }
            };

            self.execute(assignment).await;

            if self.stop.is_cancelled() {
                break;
            }
        }

        self.shared.set_state(WorkerState::Stopped);
        debug!(worker_id = self.id, "Worker stopped");
    }

    async fn execute(&self, assignment: Assignment) {
        let Assignment { job, reply, work } = assignment;

        self.shared.state.send_modify(|state| {
            *state = if self.stop.is_cancelled() {
                WorkerState::Draining
            } else {
                WorkerState::Busy
            };
        });
        trace!(worker_id = self.id, "Executing job");

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || job.execute()).await;
        let elapsed = started.elapsed();

        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX).max(1);
        self.shared.last_duration.store(nanos, Ordering::Relaxed);
        *self.shared.last_use.lock() = Instant::now();

        let result: JobResult = match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(worker_id = self.id, error = %e, "Job failed");
                }
                result
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    join_error.to_string()
                };
                error!(worker_id = self.id, panic = %message, "Job panicked");
                Err(JobError::Panicked(message))
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        drop(work);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
