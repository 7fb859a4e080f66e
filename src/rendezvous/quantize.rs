//! Start time by clock quantization.
//!
//! Both roles round `now` up to the next multiple of a shared quantum. No
//! artifact is exchanged, so the roles' clocks must agree to within the
//! guard band; otherwise the recovered message is shifted, not rejected.

use std::time::Duration;

use tracing::info;

use crate::models::RendezvousConfig;
use crate::timebase::{Clock, Epoch};

/// Quantization-based rendezvous.
#[derive(Debug, Clone)]
pub struct QuantizedRendezvous {
    quantum: Duration,
    /// Minimum gap between computing the start and the start itself
    min_lead: Duration,
}

impl QuantizedRendezvous {
    pub fn new(quantum: Duration, min_lead: Duration) -> Self {
        Self { quantum, min_lead }
    }

    pub fn from_config(config: &RendezvousConfig, slot: Duration) -> Self {
        Self::new(Duration::from_secs(config.quantum_secs), slot)
    }

    /// Next quantum boundary at least `min_lead` after `now`.
    pub fn start_after(&self, now: Epoch) -> Epoch {
        let q = self.quantum.as_secs_f64();
        let now_s = now.as_secs();
        let mut start = (now_s / q).ceil() * q;
        while start - now_s < self.min_lead.as_secs_f64() || start <= now_s {
            start += q;
        }
        Epoch::from_secs(start)
    }

    pub fn start<C: Clock>(&self, clock: &C) -> Epoch {
        let now = clock.now();
        let start = self.start_after(now);
        info!(
            start = %start,
            wait_secs = start.secs_since(now),
            quantum_secs = self.quantum.as_secs_f64(),
            "Quantized start time"
        );
        start
    }
}
