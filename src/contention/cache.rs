//! Cache-line primitives: eviction-set flushing and hit-latency probing.
//!
//! The eviction set is WAYS addresses spaced one contention-set stride
//! apart inside a single buffer, so they all map to the same cache set.
//! It is allocated once per session and reused for every slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::models::{CacheConfig, ContendError, Measurement, Result};

/// Cache line size in bytes.
pub const LINE: usize = 64;

/// Line-aligned view into an owned byte buffer.
#[derive(Debug)]
struct AlignedBuf {
    buf: Vec<u8>,
    offset: usize,
}

impl AlignedBuf {
    fn new(len: usize) -> Result<Self> {
        let bytes = len
            .checked_add(LINE)
            .ok_or(ContendError::EvictionSetAlloc { bytes: usize::MAX })?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes)
            .map_err(|_| ContendError::EvictionSetAlloc { bytes })?;
        // Writing every byte faults the pages in before the first slot.
        buf.resize(bytes, 1u8);
        let offset = buf.as_ptr().align_offset(LINE);
        Ok(Self { buf, offset })
    }

    fn ptr_at(&self, index: usize) -> *const u8 {
        self.buf[self.offset + index..].as_ptr()
    }
}

/// Addresses that together occupy every way of one cache set.
#[derive(Debug)]
pub struct EvictionSet {
    buf: AlignedBuf,
    ways: usize,
    stride: usize,
}

impl EvictionSet {
    pub fn new(ways: usize, stride: usize) -> Result<Self> {
        if ways == 0 || stride < LINE || stride % LINE != 0 {
            return Err(ContendError::InvalidInput(format!(
                "eviction set needs ways >= 1 and a line-multiple stride (ways={ways}, stride={stride})"
            )));
        }
        let span = ways
            .checked_mul(stride)
            .ok_or(ContendError::EvictionSetAlloc { bytes: usize::MAX })?;
        let buf = AlignedBuf::new(span)?;
        debug!(ways, stride, bytes = span, "Eviction set allocated");
        Ok(Self { buf, ways, stride })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.ways, config.stride)
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    /// Byte offsets of each member from the aligned base.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.ways).map(move |i| i * self.stride)
    }

    /// Flush every member line from all cache levels.
    pub fn flush_all(&self) {
        for off in self.offsets() {
            arch::flush(self.buf.ptr_at(off));
        }
        arch::fence();
    }
}

/// Modulator-side cache contention: flush the eviction set on a cadence.
#[derive(Debug, Clone)]
pub struct CacheStressor {
    evset: Arc<EvictionSet>,
    interval: Duration,
}

impl CacheStressor {
    pub fn new(evset: Arc<EvictionSet>, interval: Duration) -> Result<Self> {
        arch::ensure_supported()?;
        Ok(Self { evset, interval })
    }

    /// Flush rounds until `budget` elapses. Returns the number of rounds.
    pub async fn hold(&self, budget: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + budget;
        let mut rounds = 0;
        while tokio::time::Instant::now() < deadline {
            self.evset.flush_all();
            rounds += 1;
            let next = (tokio::time::Instant::now() + self.interval).min(deadline);
            tokio::time::sleep_until(next).await;
        }
        trace!(rounds, "flush rounds done");
        rounds
    }
}

/// Receiver-side cache probe: average cost of repeatedly re-accessing one line.
///
/// The line is a private allocation, not memory shared with the modulator.
/// Flushes reach it only by evicting from the cache set it maps to.
#[derive(Debug, Clone)]
pub struct CacheProbe {
    line: Arc<AlignedBuf>,
    accesses: u64,
    scale: u64,
}

impl CacheProbe {
    pub fn new(accesses: u64, scale: u64) -> Result<Self> {
        arch::ensure_supported()?;
        if accesses == 0 || scale == 0 {
            return Err(ContendError::InvalidInput(
                "probe accesses and scale must be > 0".into(),
            ));
        }
        Ok(Self {
            line: Arc::new(AlignedBuf::new(LINE)?),
            accesses,
            scale,
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.probe_accesses, config.probe_scale)
    }

    /// One timed trial: scaled cycles for `accesses` re-reads of the line.
    fn trial(&self) -> f64 {
        let p = self.line.ptr_at(0);
        let start = arch::cycles();
        for _ in 0..self.accesses {
            arch::touch(p);
        }
        let delta = arch::cycles().wrapping_sub(start);
        (delta / self.scale) as f64
    }

    /// Run trials back to back until `budget` elapses and average them.
    pub async fn measure(&self, budget: Duration) -> Result<Measurement> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + budget;
            let p = probe.line.ptr_at(0);
            arch::touch(p);
            arch::fence();

            let mut samples = Vec::new();
            while Instant::now() < deadline {
                samples.push(probe.trial());
            }
            Measurement::mean_of(&samples)
        })
        .await
        .map_err(|e| ContendError::Internal(format!("cache probe task failed: {e}")))
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use core::arch::x86_64::{_mm_clflush, _mm_mfence, _rdtsc};

    use crate::models::Result;

    pub fn ensure_supported() -> Result<()> {
        Ok(())
    }

    #[inline(always)]
    #[allow(unused_unsafe)]
    pub fn cycles() -> u64 {
        // SAFETY: rdtsc has no memory effects and is present on every x86_64 CPU.
        unsafe { _rdtsc() }
    }

    #[inline(always)]
    #[allow(unused_unsafe)]
    pub fn fence() {
        // SAFETY: mfence is part of SSE2, which x86_64 guarantees.
        unsafe { _mm_mfence() }
    }

    #[inline(always)]
    pub fn flush(p: *const u8) {
        // SAFETY: `p` points into a live buffer owned by the caller.
        unsafe { _mm_clflush(p) }
    }

    #[inline(always)]
    pub fn touch(p: *const u8) {
        // SAFETY: `p` points into a live, initialized buffer owned by the caller.
        unsafe {
            let _ = core::ptr::read_volatile(p);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod arch {
    use crate::models::{ContendError, Result};

    pub fn ensure_supported() -> Result<()> {
        Err(ContendError::Unsupported(
            "cache-line flush and cycle counter require x86_64".into(),
        ))
    }

    pub fn cycles() -> u64 {
        0
    }

    pub fn fence() {}

    pub fn flush(_p: *const u8) {}

    pub fn touch(p: *const u8) {
        // SAFETY: `p` points into a live, initialized buffer owned by the caller.
        unsafe {
            let _ = core::ptr::read_volatile(p);
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_set_geometry() {
        let evset = EvictionSet::new(12, 4096).unwrap();
        assert_eq!(evset.ways(), 12);
        let offsets: Vec<_> = evset.offsets().collect();
        assert_eq!(offsets.len(), 12);
        assert_eq!(offsets[11], 11 * 4096);
        for off in &offsets {
            assert_eq!(evset.buf.ptr_at(*off) as usize % LINE, 0);
        }
        evset.flush_all();
    }

    #[test]
    fn test_eviction_set_rejects_unaligned_stride() {
        assert!(EvictionSet::new(12, 100).is_err());
        assert!(EvictionSet::new(0, 4096).is_err());
    }

    #[test]
    fn test_eviction_set_overflow_is_alloc_error() {
        let err = EvictionSet::new(usize::MAX / 64, 128).unwrap_err();
        assert!(matches!(err, ContendError::EvictionSetAlloc { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_probe_collects_trials() {
        let probe = CacheProbe::new(1000, 1).unwrap();
        let m = probe.measure(Duration::from_millis(20)).await.unwrap();
        assert!(m.samples > 0);
        assert!(m.value > 0.0);
    }

    #[tokio::test]
    async fn test_stressor_stops_at_deadline() {
        let evset = Arc::new(EvictionSet::new(4, 4096).unwrap());
        let stressor = CacheStressor::new(evset, Duration::from_millis(10)).unwrap();
        let started = std::time::Instant::now();
        let rounds = stressor.hold(Duration::from_millis(55)).await;
        assert!(rounds >= 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
