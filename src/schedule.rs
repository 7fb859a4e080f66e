//! Slot scheduler shared by both roles.
//!
//! Slot `i` owns `[start + i·D, start + (i+1)·D)`. A role wakes `guard`
//! after the boundary, and if the window has already closed the slot is
//! reported as missed instead of acted on. Each slot's lateness is judged
//! independently, so one delay never shifts the rest of the session.

use std::time::Duration;

use tracing::warn;

use crate::models::{ChannelConfig, ContendError, Result};
use crate::timebase::{Clock, Epoch};

/// One slot's time window plus its guard-banded action window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub index: usize,
    /// Window begin (inclusive)
    pub start: Epoch,
    /// Window end (exclusive)
    pub end: Epoch,
    /// When the role wakes to act
    pub wake: Epoch,
    /// When the role's action must have finished
    pub deadline: Epoch,
}

/// Result of waiting for a slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotEntry {
    /// Woke inside the window; act until `slot.deadline`
    Open(Slot),
    /// Woke after the window closed; do nothing for this slot
    Missed(Slot),
}

/// Fixed-duration, contiguous slot grid.
#[derive(Debug, Clone)]
pub struct SlotSchedule {
    start: Epoch,
    slot_secs: f64,
    count: usize,
    guard_secs: f64,
    trailing_secs: f64,
}

impl SlotSchedule {
    pub fn new(
        start: Epoch,
        slot: Duration,
        count: usize,
        guard_fraction: f64,
        trailing_guard_fraction: f64,
    ) -> Result<Self> {
        let slot_secs = slot.as_secs_f64();
        if slot_secs <= 0.0 {
            return Err(ContendError::InvalidInput("slot duration must be > 0".into()));
        }
        if guard_fraction < 0.0
            || trailing_guard_fraction < 0.0
            || guard_fraction + trailing_guard_fraction >= 1.0
        {
            return Err(ContendError::InvalidInput(format!(
                "guards {guard_fraction} + {trailing_guard_fraction} leave no usable window"
            )));
        }
        Ok(Self {
            start,
            slot_secs,
            count,
            guard_secs: slot_secs * guard_fraction,
            trailing_secs: slot_secs * trailing_guard_fraction,
        })
    }

    /// Grid of `count` raw slots using the channel's timing parameters.
    pub fn from_config(start: Epoch, channel: &ChannelConfig, count: usize) -> Result<Self> {
        Self::new(
            start,
            channel.slot_duration(),
            count,
            channel.guard_fraction,
            channel.trailing_guard_fraction,
        )
    }

    pub fn start(&self) -> Epoch {
        self.start
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn slot_secs(&self) -> f64 {
        self.slot_secs
    }

    /// End of the last slot.
    pub fn end(&self) -> Epoch {
        self.boundary(self.count)
    }

    /// Boundary `k`: start of slot `k`, end of slot `k - 1`.
    fn boundary(&self, k: usize) -> Epoch {
        self.start.offset(k as f64 * self.slot_secs)
    }

    pub fn slot(&self, index: usize) -> Slot {
        let start = self.boundary(index);
        let end = self.boundary(index + 1);
        Slot {
            index,
            start,
            end,
            wake: start.offset(self.guard_secs),
            deadline: end.offset(-self.trailing_secs),
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        (0..self.count).map(|i| self.slot(i))
    }

    /// Sleep until slot `index` opens and decide whether it is still usable.
    pub async fn enter<C: Clock>(&self, clock: &C, index: usize) -> SlotEntry {
        let slot = self.slot(index);
        clock.sleep_until(slot.wake).await;
        let now = clock.now();
        if now > slot.end {
            warn!(
                slot = index,
                late_by = now.secs_since(slot.end),
                "Missed slot window"
            );
            SlotEntry::Missed(slot)
        } else {
            SlotEntry::Open(slot)
        }
    }
}
