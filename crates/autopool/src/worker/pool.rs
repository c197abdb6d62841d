//! Worker pool for job execution
//!
//! Dispatches submitted jobs to idle workers and supports graceful shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use super::worker::{Assignment, Slot, Worker, WorkerId, WorkerSnapshot, WorkerState};
use crate::job::{Job, JobHandle, ResultSender};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of workers started with the pool
    pub workers: usize,

    /// Upper bound on how long shutdown waits for outstanding work
    #[serde(with = "crate::duration_millis::option", default)]
    pub shutdown_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given initial worker count
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// - `AUTOPOOL_WORKERS`: Initial worker count (default: 4)
    /// - `AUTOPOOL_SHUTDOWN_TIMEOUT_MS`: Shutdown wait limit (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: std::env::var("AUTOPOOL_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.workers),
            shutdown_timeout: crate::duration_millis::from_env("AUTOPOOL_SHUTDOWN_TIMEOUT_MS"),
        }
    }

    /// Set the initial worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting and dispatching jobs
    Running,
    /// Shutdown in progress, finishing accepted jobs
    Draining,
    /// Shut down
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Pool no longer accepts work
    #[error("worker pool has been shut down")]
    ShutDown,

    /// Outstanding work did not finish within the shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Jobs submitted but not yet handed to a worker
struct BacklogGuard(Arc<AtomicUsize>);

impl BacklogGuard {
    fn new(backlog: &Arc<AtomicUsize>) -> Self {
        backlog.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(backlog))
    }
}

impl Drop for BacklogGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Queued {
    assignment: Assignment,
    backlog: BacklogGuard,
}

struct PoolInner {
    config: PoolConfig,
    cancel: CancellationToken,
    intake: Mutex<Option<flume::Sender<Queued>>>,
    available: mpsc::Sender<Slot>,
    workers: Mutex<BTreeMap<WorkerId, Worker>>,
    next_id: AtomicU64,
    outstanding: TaskTracker,
    backlog: Arc<AtomicUsize>,
    status: RwLock<PoolStatus>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Pool of long-lived workers
///
/// `Pool` is a cheap handle; clones share the same workers and queue. It
/// must be created inside a tokio runtime.
///
/// # Example
///
/// ```ignore
/// use autopool::{job_fn, Pool};
/// use tokio_util::sync::CancellationToken;
///
/// let pool = Pool::new(&CancellationToken::new(), 4);
///
/// pool.submit(job_fn(|| Ok(json!("fire and forget")))).await?;
///
/// let handle = pool.spawn(job_fn(|| Ok(json!(42)))).await?;
/// assert_eq!(handle.await?, json!(42));
///
/// // Waits for every accepted job, then stops the workers
/// pool.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Non-owning reference to a [`Pool`]
#[derive(Clone)]
pub struct WeakPool {
    inner: Weak<PoolInner>,
}

impl WeakPool {
    /// Get the pool back if it is still alive
    pub fn upgrade(&self) -> Option<Pool> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}

impl Pool {
    /// Create a pool with `workers` workers under the `parent` cancellation scope
    pub fn new(parent: &CancellationToken, workers: usize) -> Self {
        Self::with_config(parent, PoolConfig::new(workers))
    }

    /// Create a pool from a configuration
    pub fn with_config(parent: &CancellationToken, config: PoolConfig) -> Self {
        let cancel = parent.child_token();
        let (intake_tx, intake_rx) = flume::bounded(0);
        let (available_tx, available_rx) = mpsc::channel(config.workers.max(1));

        info!(workers = config.workers, "Starting worker pool");

        let inner = Arc::new(PoolInner {
            config,
            cancel: cancel.clone(),
            intake: Mutex::new(Some(intake_tx)),
            available: available_tx,
            workers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            outstanding: TaskTracker::new(),
            backlog: Arc::new(AtomicUsize::new(0)),
            status: RwLock::new(PoolStatus::Running),
            dispatcher: Mutex::new(None),
        });

        let pool = Self { inner };
        pool.grow(pool.inner.config.workers, None);

        let handle = tokio::spawn(dispatch(intake_rx, available_rx, cancel));
        *pool.inner.dispatcher.lock() = Some(handle);

        pool
    }

    /// Submit a job, waiting until the dispatch loop accepts it
    ///
    /// Backpressured by dispatch: returns once the dispatch loop has taken
    /// the job, not once a worker has started it.
    pub async fn submit<J: Job>(&self, job: J) -> Result<(), PoolError> {
        self.enqueue(Box::new(job), None).await
    }

    /// Submit a job and get a handle to its result
    pub async fn spawn<J: Job>(&self, job: J) -> Result<JobHandle, PoolError> {
        let (reply, handle) = JobHandle::channel();
        self.enqueue(Box::new(job), Some(reply)).await?;
        Ok(handle)
    }

    async fn enqueue(
        &self,
        job: Box<dyn Job>,
        reply: Option<ResultSender>,
    ) -> Result<(), PoolError> {
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::ShutDown);
        }
        let intake = self.inner.intake.lock().clone().ok_or(PoolError::ShutDown)?;

        let queued = Queued {
            assignment: Assignment {
                job,
                reply,
                work: self.inner.outstanding.token(),
            },
            backlog: BacklogGuard::new(&self.inner.backlog),
        };

        intake
            .send_async(queued)
            .await
            .map_err(|_| PoolError::ShutDown)
    }

    /// Number of workers currently in the pool
    ///
    /// A point-in-time snapshot; the scaler may change it at any moment.
    pub fn size(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Jobs submitted but not yet handed to a worker
    pub fn backlog(&self) -> usize {
        self.inner.backlog.load(Ordering::Relaxed)
    }

    /// Accepted jobs that have not finished yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.len()
    }

    /// Get current status
    pub fn status(&self) -> PoolStatus {
        *self.inner.status.read()
    }

    /// Whether the pool's cancellation scope has fired
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The pool's cancellation token
    ///
    /// Cancelling it stops dispatch immediately: idle workers exit, jobs not
    /// yet handed to a worker are abandoned and in-flight jobs finish.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Non-owning reference to this pool
    pub fn downgrade(&self) -> WeakPool {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Snapshots of the current workers, ordered by ID
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.inner
            .workers
            .lock()
            .values()
            .map(Worker::snapshot)
            .collect()
    }

    /// Remove a worker from the pool and drain it
    ///
    /// Returns false if no worker has this ID.
    pub fn drain_worker(&self, id: WorkerId) -> bool {
        match self.inner.workers.lock().remove(&id) {
            Some(worker) => {
                worker.drain();
                true
            }
            None => false,
        }
    }

    /// Shutdown the pool gracefully
    ///
    /// Stops accepting jobs, lets every accepted job run to completion
    /// (including retries), then cancels the pool and joins all tasks.
    /// A second call returns [`PoolError::ShutDown`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        {
            let mut status = self.inner.status.write();
            if *status != PoolStatus::Running {
                return Err(PoolError::ShutDown);
            }
            *status = PoolStatus::Draining;
        }

        info!(outstanding = self.outstanding(), "Initiating graceful shutdown");

        // Closing intake lets the dispatch loop exit once it has handed out
        // everything already accepted
        self.inner.intake.lock().take();
        self.inner.outstanding.close();

        let drained = match self.inner.config.shutdown_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.outstanding.wait())
                .await
                .is_ok(),
            None => {
                self.inner.outstanding.wait().await;
                true
            }
        };

        self.inner.cancel.cancel();

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        if drained {
            join_all(workers.into_values().map(Worker::into_handle)).await;
        }

        *self.inner.status.write() = PoolStatus::Stopped;

        if !drained {
            warn!(remaining = self.outstanding(), "Shutdown timeout reached");
            return Err(PoolError::ShutdownTimeout);
        }

        info!("Worker pool stopped");
        Ok(())
    }

    /// Start up to `count` workers, staying at or below `max`
    ///
    /// Returns how many were started.
    pub(crate) fn grow(&self, count: usize, max: Option<usize>) -> usize {
        let mut workers = self.inner.workers.lock();
        if self.inner.cancel.is_cancelled() {
            return 0;
        }

        let count = match max {
            Some(max) => count.min(max.saturating_sub(workers.len())),
            None => count,
        };

        for _ in 0..count {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::spawn(id, self.inner.available.clone(), &self.inner.cancel);
            workers.insert(id, worker);
        }
        count
    }

    /// Drain up to `count` workers without going below `floor`
    ///
    /// Idle workers are picked before busy ones, lower IDs first.
    pub(crate) fn shrink(&self, count: usize, floor: usize) -> Vec<WorkerId> {
        let mut workers = self.inner.workers.lock();
        let count = count.min(workers.len().saturating_sub(floor));

        let mut candidates: Vec<(bool, WorkerId)> = workers
            .values()
            .map(|w| (w.state() != WorkerState::Idle, w.id()))
            .collect();
        candidates.sort_unstable();

        let ids: Vec<WorkerId> = candidates.into_iter().take(count).map(|(_, id)| id).collect();
        for id in &ids {
            if let Some(worker) = workers.remove(id) {
                worker.drain();
            }
        }
        ids
    }

    /// Drain idle workers unused for longer than `max_idle`, keeping `floor`
    pub(crate) fn evict_idle(&self, max_idle: Duration, floor: usize) -> Vec<WorkerId> {
        let mut workers = self.inner.workers.lock();
        let budget = workers.len().saturating_sub(floor);

        let ids: Vec<WorkerId> = workers
            .values()
            .filter(|w| w.state() == WorkerState::Idle && w.idle_for() > max_idle)
            .map(Worker::id)
            .take(budget)
            .collect();

        for id in &ids {
            if let Some(worker) = workers.remove(id) {
                worker.drain();
            }
        }
        ids
    }

    /// Mean of the workers' last execution durations in nanoseconds
    ///
    /// Workers without a sample are excluded; `None` if nobody has one.
    pub(crate) fn mean_latency(&self) -> Option<u64> {
        let workers = self.inner.workers.lock();
        let (sum, count) = workers
            .values()
            .map(Worker::last_duration_nanos)
            .filter(|&nanos| nanos != 0)
            .fold((0u128, 0u128), |(sum, count), nanos| {
                (sum + nanos as u128, count + 1)
            });

        if count == 0 {
            None
        } else {
            Some((sum / count) as u64)
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("status", &self.status())
            .field("size", &self.size())
            .field("backlog", &self.backlog())
            .finish()
    }
}

/// Dispatch loop: hands queued jobs to advertised workers in FIFO order
async fn dispatch(
    intake: flume::Receiver<Queued>,
    mut available: mpsc::Receiver<Slot>,
    cancel: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Dispatch loop: cancelled");
                break;
            }
            received = intake.recv_async() => match received {
                Ok(queued) => queued,
                Err(_) => {
                    debug!("Dispatch loop: intake closed");
                    break;
                }
            },
        };

        if !assign(queued, &mut available, &cancel).await {
            break;
        }
    }

    debug!("Dispatch loop exited");
}

/// Hand one job to the next live worker
///
/// Returns false if the pool was cancelled first; the job is then dropped,
/// which releases its outstanding-work token.
async fn assign(
    queued: Queued,
    available: &mut mpsc::Receiver<Slot>,
    cancel: &CancellationToken,
) -> bool {
    let Queued {
        mut assignment,
        backlog,
    } = queued;

    loop {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Dispatch loop: cancelled with a job pending, abandoning it");
                return false;
            }
            slot = available.recv() => match slot {
                Some(slot) => slot,
                None => return false,
            },
        };

        match slot.send(assignment) {
            Ok(()) => {
                drop(backlog);
                return true;
            }
            Err(returned) => {
                // Worker stopped after advertising
                trace!("Skipping stale advertisement");
                assignment = returned;
            }
        }
    }
}
