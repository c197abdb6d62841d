//! End-to-end tests for the pool, scaler and retry strategy
//!
//! Run with: cargo test -p autopool --test pool_integration_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use autopool::{
    job_fn, Fibonacci, Job, JobError, Pool, PoolStatus, Retriable, RetryStrategy, Scaler,
    ScalerConfig,
};

/// Records how many times each job ID ran
#[derive(Clone, Default)]
struct Ledger {
    runs: Arc<Mutex<HashMap<usize, usize>>>,
}

impl Ledger {
    fn job(&self, id: usize, sleep: Duration) -> impl Job {
        let runs = Arc::clone(&self.runs);
        job_fn(move || {
            std::thread::sleep(sleep);
            *runs.lock().entry(id).or_insert(0) += 1;
            Ok(json!(id))
        })
    }

    fn assert_each_ran_once(&self, total: usize) {
        let runs = self.runs.lock();
        assert_eq!(runs.len(), total, "some jobs never ran");
        for (id, count) in runs.iter() {
            assert_eq!(*count, 1, "job {id} ran {count} times");
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ten_sleeping_jobs_on_four_workers() {
    let pool = Pool::new(&CancellationToken::new(), 4);
    let ledger = Ledger::default();

    let start = Instant::now();
    for id in 0..10 {
        pool.submit(ledger.job(id, Duration::from_millis(50)))
            .await
            .unwrap();
    }
    pool.shutdown().await.unwrap();

    ledger.assert_each_ran_once(10);
    // Three waves of at most four concurrent jobs
    assert!(start.elapsed() >= Duration::from_millis(150));
    assert_eq!(pool.status(), PoolStatus::Stopped);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_retry_exhaustion_runs_three_times_with_fibonacci_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let always_fails = job_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(JobError::failed("upstream unavailable"))
    });

    let pool = Pool::new(&CancellationToken::new(), 1);
    let start = Instant::now();
    let handle = pool
        .spawn(Retriable::new(always_fails, Fibonacci::new(2)))
        .await
        .unwrap();

    // Shutdown waits for the whole retry chain
    pool.shutdown().await.unwrap();
    let elapsed = start.elapsed();

    match handle.await {
        Err(JobError::RetriesExhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "upstream unavailable");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_secs(2), "slept only {elapsed:?}");
}

#[test_log::test]
fn test_retry_bound_holds_for_any_budget() {
    for max_attempts in 0..5u32 {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let job = job_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobError::failed("nope"))
        });

        let strategy = Fibonacci::new(max_attempts).with_unit(Duration::from_millis(1));
        assert!(strategy.run(&job).unwrap_err().is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), max_attempts as usize + 1);
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_no_lost_work_while_scaler_resizes_pool() {
    let pool = Pool::new(&CancellationToken::new(), 2);
    let config = ScalerConfig::new()
        .with_interval(Duration::from_millis(10))
        .with_rate(2)
        .with_samples(2)
        .with_max_idle(Duration::from_millis(15))
        .with_max_workers(12);
    let scaler = Scaler::with_config(&pool, config).unwrap().run();

    let ledger = Ledger::default();
    let mut submitters = Vec::new();
    for batch in 0..4 {
        let pool = pool.clone();
        let ledger = ledger.clone();
        submitters.push(tokio::spawn(async move {
            for i in 0..50 {
                let id = batch * 50 + i;
                let sleep = Duration::from_millis((id % 7) as u64 * 3);
                pool.submit(ledger.job(id, sleep)).await.unwrap();
                if i % 10 == 0 {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }));
    }

    for submitter in submitters {
        submitter.await.unwrap();
    }
    pool.shutdown().await.unwrap();
    scaler.await.unwrap();

    ledger.assert_each_ran_once(200);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_scaler_grows_under_backlog_and_evicts_when_idle() {
    let pool = Pool::new(&CancellationToken::new(), 1);
    let config = ScalerConfig::new()
        .with_interval(Duration::from_millis(20))
        .with_rate(2)
        .with_max_idle(Duration::from_millis(100))
        .with_min_workers(1)
        .with_max_workers(8);
    let scaler = Scaler::with_config(&pool, config).unwrap().run();

    let ledger = Ledger::default();
    let mut handles = Vec::new();
    for id in 0..16 {
        let pool = pool.clone();
        let job = ledger.job(id, Duration::from_millis(100));
        handles.push(tokio::spawn(async move {
            pool.spawn(job).await.unwrap().await
        }));
    }

    let mut peak = pool.size();
    let deadline = Instant::now() + Duration::from_secs(3);
    while peak < 4 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
        peak = peak.max(pool.size());
    }
    assert!(peak >= 4, "pool never grew, peak size {peak}");

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Idle workers are drained back to the floor
    let deadline = Instant::now() + Duration::from_secs(3);
    while pool.size() > 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pool.size(), 1);

    pool.shutdown().await.unwrap();
    scaler.await.unwrap();
    ledger.assert_each_ran_once(16);
}

#[test_log::test(tokio::test)]
async fn test_misuse_fails_fast() {
    let pool = Pool::new(&CancellationToken::new(), 2);
    pool.shutdown().await.unwrap();

    assert!(pool.submit(job_fn(|| Ok(json!(null)))).await.is_err());
    assert!(pool.spawn(job_fn(|| Ok(json!(null)))).await.is_err());
    assert!(pool.shutdown().await.is_err());
}
