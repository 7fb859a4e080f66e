//! Clock access and deadline sleeping.
//!
//! [`SystemClock`] drives real sessions. [`ManualClock`] is a virtual clock
//! for deterministic slot-loop tests: sleeping jumps time forward instantly.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::trace;

use super::Epoch;
use crate::models::{ClockSource, ContendError, Result};

/// Source of session time.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current time. Never goes backwards within a process.
    fn now(&self) -> Epoch;

    /// Block until `now() >= target`; returns immediately if already past.
    fn sleep_until(&self, target: Epoch) -> impl Future<Output = ()> + Send;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone)]
pub struct SystemClock {
    source: ClockSource,
    /// Highest value handed out so far, as f64 bits
    floor: Arc<AtomicU64>,
}

impl SystemClock {
    /// Open the clock, failing if it cannot be read.
    pub fn new(source: ClockSource) -> Result<Self> {
        let first = read_raw(source)?;
        Ok(Self {
            source,
            floor: Arc::new(AtomicU64::new(first.to_bits())),
        })
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }
}

fn read_raw(source: ClockSource) -> Result<f64> {
    let secs = match source {
        ClockSource::Monotonic => {
            let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
            ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
        }
        ClockSource::Wall => {
            let now = Utc::now();
            now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
        }
    };
    if secs.is_finite() && secs >= 0.0 {
        Ok(secs)
    } else {
        Err(ContendError::Clock(format!("{source:?} clock returned {secs}")))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Epoch {
        // A failed read after construction is treated as "no progress".
        let raw = read_raw(self.source).unwrap_or(0.0);
        let prev = self
            .floor
            .fetch_max(raw.to_bits(), Ordering::AcqRel);
        // Non-negative f64 bit patterns order the same way as the values.
        Epoch::from_secs(f64::from_bits(prev.max(raw.to_bits())))
    }

    async fn sleep_until(&self, target: Epoch) {
        loop {
            let now = self.now();
            if now >= target {
                return;
            }
            let remaining = target.remaining_from(now);
            trace!(remaining_ms = remaining.as_secs_f64() * 1e3, "sleeping");
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Virtual clock for tests and dry runs.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new(start: Epoch) -> Self {
        Self {
            now: Arc::new(Mutex::new(start.as_secs())),
        }
    }

    /// Move time forward by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += secs.max(0.0);
    }

    /// Move time forward to `target` if it lies in the future.
    pub fn advance_to(&self, target: Epoch) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.max(target.as_secs());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Epoch {
        Epoch::from_secs(*self.now.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn sleep_until(&self, target: Epoch) {
        self.advance_to(target);
        tokio::task::yield_now().await;
    }
}
