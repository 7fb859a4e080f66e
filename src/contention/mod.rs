//! Contention primitives for both roles.
//!
//! Provides:
//! - `Stressor`: what the modulator does during a ONE slot
//! - `Probe`: what the sensor does during every slot
//! - `StressStrategy` / `ProbeStrategy`: the configured realization of each
//!
//! Two realizations exist for each side: the external bandwidth workload
//! (a stress pool, or timed runs reporting throughput) and direct cache-line
//! operations on an eviction set (flush rounds, or a cycle-timed probe).

mod cache;
mod pool;
mod workload;

pub use cache::*;
pub use pool::*;
pub use workload::*;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::decode::Polarity;
use crate::models::{Config, Measurement, ModulationStrategy, Result, SensingStrategy};

/// Pause between consecutive probe runs of the workload.
const RUN_GAP: Duration = Duration::from_millis(1);

/// Drives contention on the shared resource.
pub trait Stressor: Clone + Send + Sync + 'static {
    /// Contend for `budget`, then release every resource acquired.
    fn hold(&self, budget: Duration) -> impl Future<Output = Result<HoldReport>> + Send;
}

/// Observes the shared resource.
pub trait Probe: Clone + Send + Sync + 'static {
    /// Which way contention moves this probe's measurements.
    fn polarity(&self) -> Polarity;

    /// Measure for at most `budget` and aggregate into one value.
    ///
    /// An empty measurement is a valid result, not an error.
    fn measure(&self, budget: Duration) -> impl Future<Output = Result<Measurement>> + Send;
}

/// Throughput probe: run the workload repeatedly and average its reports.
#[derive(Debug, Clone)]
pub struct BandwidthProbe {
    workload: Arc<Workload>,
}

impl BandwidthProbe {
    pub fn new(workload: Arc<Workload>) -> Self {
        Self { workload }
    }
}

impl Probe for BandwidthProbe {
    fn polarity(&self) -> Polarity {
        Polarity::LowerIsContended
    }

    async fn measure(&self, budget: Duration) -> Result<Measurement> {
        let deadline = tokio::time::Instant::now() + budget;
        let mut samples = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.workload.run_once(remaining).await {
                Ok(RunOutcome::Completed {
                    throughput: Some(v),
                    ..
                }) => samples.push(v),
                Ok(RunOutcome::Completed { throughput: None, .. }) => {}
                Ok(RunOutcome::TimedOut) => break,
                Err(e) if samples.is_empty() => return Err(e),
                Err(e) => {
                    warn!(error = %e, samples = samples.len(), "Probe run failed; keeping samples so far");
                    break;
                }
            }
            tokio::time::sleep(RUN_GAP.min(remaining)).await;
        }
        Ok(Measurement::mean_of(&samples))
    }
}

impl Probe for CacheProbe {
    fn polarity(&self) -> Polarity {
        Polarity::HigherIsContended
    }

    async fn measure(&self, budget: Duration) -> Result<Measurement> {
        CacheProbe::measure(self, budget).await
    }
}

impl Stressor for StressPool {
    async fn hold(&self, budget: Duration) -> Result<HoldReport> {
        StressPool::hold(self, budget).await
    }
}

impl Stressor for CacheStressor {
    async fn hold(&self, budget: Duration) -> Result<HoldReport> {
        CacheStressor::hold(self, budget).await;
        Ok(HoldReport::default())
    }
}

/// Configured modulation primitive.
#[derive(Debug, Clone)]
pub enum StressStrategy {
    Workload(StressPool),
    Cache(CacheStressor),
}

impl StressStrategy {
    /// Build the stressor selected by `modulation.strategy`.
    ///
    /// The cache variant allocates its eviction set here, once per session.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.modulation.strategy {
            ModulationStrategy::Workload => {
                let workload = Workload::from_config(&config.workload)?;
                Ok(Self::Workload(StressPool::new(
                    Arc::new(workload),
                    config.workload.pool_size,
                )))
            }
            ModulationStrategy::Cache => {
                let evset = EvictionSet::from_config(&config.cache)?;
                Ok(Self::Cache(CacheStressor::new(
                    Arc::new(evset),
                    Duration::from_millis(config.cache.flush_interval_ms),
                )?))
            }
        }
    }
}

impl Stressor for StressStrategy {
    async fn hold(&self, budget: Duration) -> Result<HoldReport> {
        match self {
            Self::Workload(pool) => Stressor::hold(pool, budget).await,
            Self::Cache(cache) => Stressor::hold(cache, budget).await,
        }
    }
}

/// Configured sensing primitive.
#[derive(Debug, Clone)]
pub enum ProbeStrategy {
    Bandwidth(BandwidthProbe),
    Cache(CacheProbe),
}

impl ProbeStrategy {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.sensing.strategy {
            SensingStrategy::Bandwidth => {
                let workload = Workload::from_config(&config.workload)?;
                Ok(Self::Bandwidth(BandwidthProbe::new(Arc::new(workload))))
            }
            SensingStrategy::Cache => Ok(Self::Cache(CacheProbe::from_config(&config.cache)?)),
        }
    }
}

impl Probe for ProbeStrategy {
    fn polarity(&self) -> Polarity {
        match self {
            Self::Bandwidth(p) => p.polarity(),
            Self::Cache(p) => Probe::polarity(p),
        }
    }

    async fn measure(&self, budget: Duration) -> Result<Measurement> {
        match self {
            Self::Bandwidth(p) => p.measure(budget).await,
            Self::Cache(p) => Probe::measure(p, budget).await,
        }
    }
}
