//! Modulator role: turn a bitstring into timed contention.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::InFlight;
use crate::contention::{HoldReport, Stressor};
use crate::decode::Repetition;
use crate::models::{
    ChannelConfig, Config, ContendError, Result, SlotMode, Symbol, TransmitReport,
};
use crate::rendezvous::Rendezvous;
use crate::schedule::{Slot, SlotEntry, SlotSchedule};
use crate::timebase::Clock;

/// What the modulator did in one raw slot.
#[derive(Debug)]
enum SlotAction {
    Contended(HoldReport),
    Idle,
    Missed,
    Failed,
}

fn tally(report: &mut TransmitReport, action: &SlotAction) {
    match action {
        SlotAction::Contended(hold) => {
            report.contended += 1;
            report.launches += hold.launches;
        }
        SlotAction::Idle => report.idle += 1,
        SlotAction::Missed => report.missed += 1,
        SlotAction::Failed => report.failed += 1,
    }
}

/// Sender side of the channel.
pub struct Modulator<C: Clock, S: Stressor> {
    clock: C,
    stressor: S,
    rendezvous: Rendezvous,
    channel: ChannelConfig,
    repetition: Repetition,
    preroll: Duration,
}

impl<C: Clock, S: Stressor> Modulator<C, S> {
    pub fn new(clock: C, stressor: S, rendezvous: Rendezvous, channel: ChannelConfig) -> Result<Self> {
        let repetition = Repetition::new(channel.repetition)?;
        Ok(Self {
            clock,
            stressor,
            rendezvous,
            channel,
            repetition,
            preroll: Duration::ZERO,
        })
    }

    pub fn from_config(clock: C, stressor: S, config: &Config) -> Result<Self> {
        Ok(Self::new(
            clock,
            stressor,
            Rendezvous::from_config(config),
            config.channel.clone(),
        )?
        .with_preroll(Duration::from_millis(config.modulation.preroll_ms)))
    }

    /// Start contention this early when raw slot 0 carries a one.
    pub fn with_preroll(mut self, preroll: Duration) -> Self {
        self.preroll = preroll;
        self
    }

    /// Transmit `bits` over one session.
    ///
    /// With the artifact rendezvous the artifact exists exactly as long as
    /// this call runs.
    pub async fn transmit(&self, bits: &[Symbol]) -> Result<TransmitReport> {
        if bits.is_empty() {
            return Err(ContendError::InvalidInput("nothing to transmit".into()));
        }
        if let Some(pos) = bits.iter().position(|b| *b == Symbol::Erasure) {
            return Err(ContendError::InvalidInput(format!(
                "bit {pos}: an erasure cannot be transmitted"
            )));
        }

        let started = Instant::now();
        let raw = self.repetition.encode(bits);
        if self.channel.mode == SlotMode::Gather && raw.len() > self.channel.max_in_flight {
            return Err(ContendError::CapacityExceeded {
                capacity: self.channel.max_in_flight,
            });
        }

        let (start, guard) = self.rendezvous.establish_as_modulator(&self.clock)?;
        let schedule = SlotSchedule::from_config(start, &self.channel, raw.len())?;
        info!(
            bits = bits.len(),
            raw_slots = raw.len(),
            repetition = self.repetition.get(),
            start = %start,
            mode = ?self.channel.mode,
            "Starting transmission"
        );

        let mut report = match self.channel.mode {
            SlotMode::Blocking => self.run_blocking(&schedule, &raw).await?,
            SlotMode::Gather => self.run_gather(&schedule, &raw).await?,
        };

        if let Some(guard) = guard {
            if let Err(e) = guard.remove() {
                warn!(error = %e, "Failed to remove start-time artifact");
            }
        }

        report.total_slots = raw.len();
        report.runtime_secs = started.elapsed().as_secs_f64();
        info!(
            contended = report.contended,
            idle = report.idle,
            missed = report.missed,
            failed = report.failed,
            "Transmission complete"
        );
        Ok(report)
    }

    /// Wait for raw slot `index`, honoring the preroll for a leading one.
    async fn enter(&self, schedule: &SlotSchedule, index: usize, symbol: Symbol) -> SlotEntry {
        if index != 0 || symbol != Symbol::One || self.preroll.is_zero() {
            return schedule.enter(&self.clock, index).await;
        }
        let slot = schedule.slot(0);
        self.clock.sleep_until(slot.start - self.preroll).await;
        if self.clock.now() > slot.end {
            SlotEntry::Missed(slot)
        } else {
            debug!(preroll_ms = self.preroll.as_millis() as u64, "Contending ahead of slot 0");
            SlotEntry::Open(slot)
        }
    }

    async fn run_blocking(&self, schedule: &SlotSchedule, raw: &[Symbol]) -> Result<TransmitReport> {
        let mut report = TransmitReport::default();
        for (i, &symbol) in raw.iter().enumerate() {
            let action = match self.enter(schedule, i, symbol).await {
                SlotEntry::Missed(_) => SlotAction::Missed,
                SlotEntry::Open(slot) => match symbol {
                    Symbol::One => {
                        let budget = slot.deadline.remaining_from(self.clock.now());
                        contend(&self.stressor, slot.index, budget).await?
                    }
                    _ => {
                        self.clock.sleep_until(slot.deadline).await;
                        SlotAction::Idle
                    }
                },
            };
            debug!(slot = i, symbol = %symbol, action = ?action, "Slot done");
            tally(&mut report, &action);
        }
        Ok(report)
    }

    /// Launch every ONE slot at its wake time; collect all of them at the end.
    async fn run_gather(&self, schedule: &SlotSchedule, raw: &[Symbol]) -> Result<TransmitReport> {
        let mut report = TransmitReport::default();
        let mut inflight = InFlight::new(self.channel.max_in_flight);
        for (i, &symbol) in raw.iter().enumerate() {
            let slot: Slot = match self.enter(schedule, i, symbol).await {
                SlotEntry::Missed(_) => {
                    tally(&mut report, &SlotAction::Missed);
                    continue;
                }
                SlotEntry::Open(slot) => slot,
            };
            if symbol != Symbol::One {
                tally(&mut report, &SlotAction::Idle);
                continue;
            }
            let stressor = self.stressor.clone();
            let budget = slot.deadline.remaining_from(self.clock.now());
            inflight.launch(i, async move { contend(&stressor, i, budget).await })?;
        }

        self.clock.sleep_until(schedule.end()).await;
        for (slot, joined) in inflight.gather().await {
            let action = match joined {
                Ok(action) => action?,
                Err(e) => {
                    warn!(slot, error = %e, "Slot action panicked");
                    SlotAction::Failed
                }
            };
            tally(&mut report, &action);
        }
        Ok(report)
    }
}

/// Hold contention for one slot. Recoverable failures degrade the slot.
async fn contend<S: Stressor>(stressor: &S, slot: usize, budget: Duration) -> Result<SlotAction> {
    match stressor.hold(budget).await {
        Ok(hold) => Ok(SlotAction::Contended(hold)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(slot, error = %e, "Contention failed; slot degraded");
            Ok(SlotAction::Failed)
        }
    }
}
