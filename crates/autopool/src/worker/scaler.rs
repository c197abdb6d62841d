//! Autonomous pool scaling
//!
//! Samples mean worker latency at a fixed interval, classifies the pool as
//! overloaded or not using directional hysteresis, and grows or shrinks the
//! worker set accordingly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::pool::{Pool, WeakPool};

/// Scaler configuration
///
/// # Example
///
/// ```
/// use autopool::ScalerConfig;
/// use std::time::Duration;
///
/// let config = ScalerConfig::default()
///     .with_interval(Duration::from_millis(250))
///     .with_rate(4)
///     .with_max_workers(64);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalerConfig {
    /// Time between samples
    #[serde(with = "crate::duration_millis")]
    pub interval: Duration,

    /// Workers added per level when growing, drained when shrinking
    pub rate: usize,

    /// Consecutive same-direction periods needed to re-evaluate overload
    pub samples: u32,

    /// Lowest scale level
    pub min_level: u32,

    /// Highest scale level
    pub max_level: u32,

    /// Idle workers unused for longer than this are drained
    #[serde(with = "crate::duration_millis")]
    pub max_idle: Duration,

    /// Scaling never drains below this many workers
    pub min_workers: usize,

    /// Scaling never grows above this many workers
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            rate: 10,
            samples: 3,
            min_level: 1,
            max_level: 3,
            max_idle: Duration::from_secs(1),
            min_workers: 1,
            max_workers: None,
        }
    }
}

impl ScalerConfig {
    /// Create a new scaler configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults:
    /// - `AUTOPOOL_SCALER_INTERVAL_MS`
    /// - `AUTOPOOL_SCALER_RATE`
    /// - `AUTOPOOL_SCALER_SAMPLES`
    /// - `AUTOPOOL_SCALER_MAX_IDLE_MS`
    /// - `AUTOPOOL_SCALER_MIN_WORKERS`
    /// - `AUTOPOOL_SCALER_MAX_WORKERS`
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        let defaults = Self::default();
        Self {
            interval: crate::duration_millis::from_env("AUTOPOOL_SCALER_INTERVAL_MS")
                .unwrap_or(defaults.interval),
            rate: parsed("AUTOPOOL_SCALER_RATE").unwrap_or(defaults.rate),
            samples: parsed("AUTOPOOL_SCALER_SAMPLES").unwrap_or(defaults.samples),
            max_idle: crate::duration_millis::from_env("AUTOPOOL_SCALER_MAX_IDLE_MS")
                .unwrap_or(defaults.max_idle),
            min_workers: parsed("AUTOPOOL_SCALER_MIN_WORKERS").unwrap_or(defaults.min_workers),
            max_workers: parsed("AUTOPOOL_SCALER_MAX_WORKERS"),
            ..defaults
        }
    }

    /// Set the sampling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the scale step
    pub fn with_rate(mut self, rate: usize) -> Self {
        self.rate = rate;
        self
    }

    /// Set how many consecutive periods confirm a trend
    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    /// Set the scale level range
    pub fn with_levels(mut self, min: u32, max: u32) -> Self {
        self.min_level = min;
        self.max_level = max;
        self
    }

    /// Set the idle ceiling
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the worker floor
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    /// Set the worker ceiling
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ScalerError> {
        if self.interval.is_zero() {
            return Err(ScalerError::InvalidConfig(
                "interval must be greater than zero".into(),
            ));
        }
        if self.rate == 0 {
            return Err(ScalerError::InvalidConfig("rate must be at least 1".into()));
        }
        if self.samples == 0 {
            return Err(ScalerError::InvalidConfig("samples must be at least 1".into()));
        }
        if self.min_level == 0 || self.min_level > self.max_level {
            return Err(ScalerError::InvalidConfig(
                "levels must satisfy 1 <= min_level <= max_level".into(),
            ));
        }
        if let Some(max) = self.max_workers {
            if max < self.min_workers {
                return Err(ScalerError::InvalidConfig(
                    "max_workers must not be less than min_workers".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Scaler errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScalerError {
    /// Invalid configuration
    #[error("invalid scaler configuration: {0}")]
    InvalidConfig(String),
}

/// What the scaler decided to do in one period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    /// Leave the pool as it is
    None,
    /// Start more workers
    Grow { count: usize },
    /// Drain workers
    Shrink { count: usize },
}

/// Control state of the scaler
///
/// Pure bookkeeping: feed it one latency sample per period with
/// [`observe`](Self::observe), then ask for a [`decide`](Self::decide).
///
/// A trend reversal resets the period counter to zero and lowers the level
/// by one; the reversing period is not counted. After `samples` further
/// periods in one direction the level rises by one and the overload flag is
/// set to the current direction.
#[derive(Debug, Clone)]
pub struct ScalerState {
    rate: usize,
    samples: u32,
    min_level: u32,
    max_level: u32,
    /// Mean latency of the previous period in nanoseconds, 0 = none
    mean: u64,
    period: u32,
    level: u32,
    rising: Option<bool>,
    overload: bool,
}

impl ScalerState {
    /// Create the initial state for a configuration
    pub fn new(config: &ScalerConfig) -> Self {
        Self {
            rate: config.rate,
            samples: config.samples,
            min_level: config.min_level,
            max_level: config.max_level,
            mean: 0,
            period: 0,
            level: config.min_level,
            rising: None,
            overload: false,
        }
    }

    /// Record one period's mean latency in nanoseconds
    ///
    /// Nothing is classified without both a previous and a current sample.
    pub fn observe(&mut self, mean: Option<u64>) {
        let current = mean.unwrap_or(0);
        let previous = std::mem::replace(&mut self.mean, current);
        if previous == 0 || current == 0 {
            return;
        }

        let rising = current > previous;
        if self.rising.is_some_and(|was| was != rising) {
            // The flip period itself does not count toward the new trend
            self.period = 0;
            if self.level > self.min_level {
                self.level -= 1;
            }
        } else {
            self.period += 1;
        }
        self.rising = Some(rising);

        if self.period >= self.samples {
            self.period = 0;
            if self.level < self.max_level {
                self.level += 1;
            }
            self.overload = rising;
        }

        trace!(
            mean_ns = current,
            rising,
            period = self.period,
            level = self.level,
            overload = self.overload,
            "Latency classified"
        );
    }

    /// Decide the next action given the number of jobs waiting for a worker
    pub fn decide(&self, backlog: usize) -> ScalingDecision {
        if self.overload {
            ScalingDecision::Shrink { count: self.rate }
        } else if backlog > 0 {
            ScalingDecision::Grow {
                count: self.rate.saturating_mul(self.level as usize),
            }
        } else {
            ScalingDecision::None
        }
    }

    /// Current scale level
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether latency was classified as trending up
    pub fn is_overloaded(&self) -> bool {
        self.overload
    }

    /// Direction of the last classified period, `None` before the first
    pub fn is_rising(&self) -> Option<bool> {
        self.rising
    }

    /// Consecutive periods in the current direction
    pub fn period(&self) -> u32 {
        self.period
    }

    /// Mean latency of the last period in nanoseconds, 0 if none
    pub fn mean(&self) -> u64 {
        self.mean
    }
}

/// Controls the size of a worker pool
///
/// Holds a non-owning reference to the pool. The loop started by
/// [`run`](Self::run) stops when the pool is cancelled or dropped.
///
/// # Example
///
/// ```ignore
/// let pool = Pool::new(&CancellationToken::new(), 4);
/// let scaler = Scaler::new(&pool).run();
///
/// // ... submit work; the pool grows and shrinks with load
///
/// pool.shutdown().await?;
/// scaler.await?;
/// ```
pub struct Scaler {
    pool: WeakPool,
    config: ScalerConfig,
    state: ScalerState,
}

impl Scaler {
    /// Create a scaler with default configuration
    pub fn new(pool: &Pool) -> Self {
        let config = ScalerConfig::default();
        let state = ScalerState::new(&config);
        Self {
            pool: pool.downgrade(),
            config,
            state,
        }
    }

    /// Create a scaler with a validated configuration
    pub fn with_config(pool: &Pool, config: ScalerConfig) -> Result<Self, ScalerError> {
        config.validate()?;
        let state = ScalerState::new(&config);
        Ok(Self {
            pool: pool.downgrade(),
            config,
            state,
        })
    }

    /// Control state
    pub fn state(&self) -> &ScalerState {
        &self.state
    }

    /// Configuration
    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    /// Run one sampling period: sample, classify, act, evict idle workers
    ///
    /// Returns `None` if the pool is gone.
    pub fn tick(&mut self) -> Option<ScalingDecision> {
        let pool = self.pool.upgrade()?;

        self.state.observe(pool.mean_latency());
        let decision = self.state.decide(pool.backlog());

        match decision {
            ScalingDecision::Grow { count } => {
                let added = pool.grow(count, self.config.max_workers);
                if added > 0 {
                    info!(
                        added,
                        level = self.state.level(),
                        size = pool.size(),
                        "Scaled pool up"
                    );
                }
            }
            ScalingDecision::Shrink { count } => {
                let drained = pool.shrink(count, self.config.min_workers);
                if !drained.is_empty() {
                    info!(
                        drained = drained.len(),
                        level = self.state.level(),
                        size = pool.size(),
                        "Scaled pool down under overload"
                    );
                }
            }
            ScalingDecision::None => {}
        }

        let evicted = pool.evict_idle(self.config.max_idle, self.config.min_workers);
        if !evicted.is_empty() {
            debug!(evicted = ?evicted, size = pool.size(), "Drained idle workers");
        }

        Some(decision)
    }

    /// Start the scaling loop
    ///
    /// The loop ends when the pool's cancellation fires or the pool is
    /// dropped.
    pub fn run(mut self) -> JoinHandle<()> {
        let cancel = self.pool.upgrade().map(|pool| pool.cancellation_token());

        tokio::spawn(async move {
            let Some(cancel) = cancel else {
                return;
            };

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Scaler loop: cancellation requested");
                        break;
                    }
                    _ = ticker.tick() => {
                        if self.tick().is_none() {
                            break;
                        }
                    }
                }
            }

            debug!("Scaler loop exited");
        })
    }
}
