//! Sensor role: measure every slot and decode the recovered message.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use super::InFlight;
use crate::calibrate::Calibrator;
use crate::contention::Probe;
use crate::decode::{Decoder, Repetition, Threshold};
use crate::models::{
    ChannelConfig, Config, ContendError, ReceiveReport, Result, SlotMode, SlotOutcome, SlotRecord,
};
use crate::rendezvous::Rendezvous;
use crate::schedule::{Slot, SlotEntry, SlotSchedule};
use crate::timebase::{Clock, Epoch};

/// Receiver side of the channel.
pub struct Sensor<C: Clock, P: Probe> {
    clock: C,
    probe: P,
    rendezvous: Rendezvous,
    calibrator: Calibrator,
    channel: ChannelConfig,
    repetition: Repetition,
    warmup: Duration,
    records: Option<PathBuf>,
    progress: bool,
}

impl<C: Clock, P: Probe> Sensor<C, P> {
    pub fn new(
        clock: C,
        probe: P,
        rendezvous: Rendezvous,
        calibrator: Calibrator,
        channel: ChannelConfig,
    ) -> Result<Self> {
        let repetition = Repetition::new(channel.repetition)?;
        Ok(Self {
            clock,
            probe,
            rendezvous,
            calibrator,
            channel,
            repetition,
            warmup: Duration::ZERO,
            records: None,
            progress: false,
        })
    }

    pub fn from_config(clock: C, probe: P, config: &Config) -> Result<Self> {
        Ok(Self::new(
            clock,
            probe,
            Rendezvous::from_config(config),
            Calibrator::from_config(config),
            config.channel.clone(),
        )?
        .with_warmup(Duration::from_millis(config.sensing.warmup_ms)))
    }

    /// Take one discarded measurement ending at slot 0.
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// Write per-slot records as JSON lines to `path`.
    pub fn with_records(mut self, path: Option<PathBuf>) -> Self {
        self.records = path;
        self
    }

    /// Show a progress bar over raw slots.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Full session: calibrate, rendezvous, receive.
    ///
    /// A channel that cannot be received is rejected before calibrating.
    pub async fn run(&self) -> Result<ReceiveReport> {
        let started = Instant::now();
        self.raw_slots()?;
        let calibration = self.calibrator.calibrate(&self.probe).await?;
        let start = self.rendezvous.establish_as_sensor(&self.clock).await?;
        let mut report = self.receive(start, calibration.threshold).await?;
        report.baseline = calibration.baseline;
        report.runtime_secs = started.elapsed().as_secs_f64();
        Ok(report)
    }

    /// Raw slot count, checked against the gather-mode in-flight cap.
    fn raw_slots(&self) -> Result<usize> {
        let total = self
            .channel
            .bits
            .checked_mul(self.repetition.get())
            .ok_or_else(|| ContendError::InvalidInput("bits × repetition overflows".into()))?;
        if self.channel.mode == SlotMode::Gather && total > self.channel.max_in_flight {
            return Err(ContendError::CapacityExceeded {
                capacity: self.channel.max_in_flight,
            });
        }
        Ok(total)
    }

    /// Measure and decode `channel.bits` logical bits starting at `start`.
    pub async fn receive(&self, start: Epoch, threshold: Threshold) -> Result<ReceiveReport> {
        let started = Instant::now();
        let total = self.raw_slots()?;
        let schedule = SlotSchedule::from_config(start, &self.channel, total)?;
        info!(
            bits = self.channel.bits,
            raw_slots = total,
            threshold = threshold.value,
            start = %start,
            mode = ?self.channel.mode,
            "Starting reception"
        );

        self.warm_up(&schedule).await;

        let pb = self.progress_bar(total);
        let outcomes = match self.channel.mode {
            SlotMode::Blocking => self.sense_blocking(&schedule, threshold, &pb).await?,
            SlotMode::Gather => self.sense_gather(&schedule, threshold, &pb).await?,
        };

        let records: Vec<SlotRecord> = outcomes
            .iter()
            .enumerate()
            .map(|(i, outcome)| self.record(&schedule.slot(i), *outcome, threshold))
            .collect();
        if let Some(path) = &self.records {
            write_records(path, &records)?;
        }

        let message = Decoder::new(threshold, self.repetition).decode(&outcomes);
        pb.finish_with_message(format!("Done! {} erasures", message.erasures()));

        let count = |pred: fn(&SlotOutcome) -> bool| outcomes.iter().filter(|o| pred(o)).count();
        let report = ReceiveReport {
            baseline: None,
            threshold: threshold.value,
            total_slots: total,
            missed: count(|o| matches!(o, SlotOutcome::Missed)),
            failed: count(|o| matches!(o, SlotOutcome::Failed)),
            empty: count(|o| o.measurement().is_some_and(|m| m.is_empty())),
            message,
            runtime_secs: started.elapsed().as_secs_f64(),
        };
        info!(message = %report.message, missed = report.missed, failed = report.failed, "Reception complete");
        Ok(report)
    }

    async fn warm_up(&self, schedule: &SlotSchedule) {
        if self.warmup.is_zero() || schedule.is_empty() {
            return;
        }
        let first = schedule.start();
        self.clock.sleep_until(first - self.warmup).await;
        let budget = first.remaining_from(self.clock.now());
        if budget.is_zero() {
            return;
        }
        match self.probe.measure(budget).await {
            Ok(m) => debug!(value = m.value, samples = m.samples, "Warm-up measurement discarded"),
            Err(e) => debug!(error = %e, "Warm-up measurement failed"),
        }
    }

    async fn sense_blocking(
        &self,
        schedule: &SlotSchedule,
        threshold: Threshold,
        pb: &ProgressBar,
    ) -> Result<Vec<SlotOutcome>> {
        let mut outcomes = Vec::with_capacity(schedule.len());
        for i in 0..schedule.len() {
            let outcome = match schedule.enter(&self.clock, i).await {
                SlotEntry::Missed(_) => SlotOutcome::Missed,
                SlotEntry::Open(slot) => {
                    let budget = slot.deadline.remaining_from(self.clock.now());
                    sense(&self.probe, i, budget).await?
                }
            };
            self.log_slot(&schedule.slot(i), outcome, threshold);
            pb.inc(1);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn sense_gather(
        &self,
        schedule: &SlotSchedule,
        threshold: Threshold,
        pb: &ProgressBar,
    ) -> Result<Vec<SlotOutcome>> {
        let mut outcomes = vec![SlotOutcome::Missed; schedule.len()];
        let mut inflight = InFlight::new(self.channel.max_in_flight);
        for i in 0..schedule.len() {
            if let SlotEntry::Open(slot) = schedule.enter(&self.clock, i).await {
                let probe = self.probe.clone();
                let budget = slot.deadline.remaining_from(self.clock.now());
                inflight.launch(i, async move { sense(&probe, i, budget).await })?;
            }
            pb.inc(1);
        }

        self.clock.sleep_until(schedule.end()).await;
        for (i, joined) in inflight.gather().await {
            outcomes[i] = match joined {
                Ok(outcome) => outcome?,
                Err(e) => {
                    warn!(slot = i, error = %e, "Slot action panicked");
                    SlotOutcome::Failed
                }
            };
        }
        for (i, outcome) in outcomes.iter().enumerate() {
            self.log_slot(&schedule.slot(i), *outcome, threshold);
        }
        Ok(outcomes)
    }

    fn record(&self, slot: &Slot, outcome: SlotOutcome, threshold: Threshold) -> SlotRecord {
        SlotRecord {
            slot: slot.index,
            bit: self.repetition.bit_of(slot.index),
            sub_slot: self.repetition.sub_slot_of(slot.index),
            scheduled_at: slot.start.as_secs(),
            outcome,
            symbol: threshold.symbol_for(&outcome),
            recorded_at: Utc::now(),
        }
    }

    fn log_slot(&self, slot: &Slot, outcome: SlotOutcome, threshold: Threshold) {
        let symbol = threshold.symbol_for(&outcome);
        match outcome.measurement() {
            Some(m) => info!(
                slot = slot.index,
                bit = self.repetition.bit_of(slot.index),
                measurement = m.value,
                samples = m.samples,
                symbol = %symbol,
                "Slot measured"
            ),
            None => info!(slot = slot.index, outcome = ?outcome, symbol = %symbol, "Slot erased"),
        }
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb
    }
}

/// Measure one slot. Recoverable failures degrade the slot to `Failed`.
async fn sense<P: Probe>(probe: &P, slot: usize, budget: Duration) -> Result<SlotOutcome> {
    match probe.measure(budget).await {
        Ok(measurement) => Ok(SlotOutcome::Measured { measurement }),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(slot, error = %e, "Sensing failed; slot erased");
            Ok(SlotOutcome::Failed)
        }
    }
}

/// Write records as JSON lines.
pub fn write_records(path: &Path, records: &[SlotRecord]) -> Result<()> {
    let file = File::create(path).map_err(|e| ContendError::io("creating records file", e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        let json = serde_json::to_string(record)
            .map_err(|e| ContendError::Internal(format!("Failed to serialize record: {}", e)))?;
        writeln!(writer, "{}", json).map_err(|e| ContendError::io("writing records", e))?;
    }
    writer
        .flush()
        .map_err(|e| ContendError::io("flushing records", e))?;
    info!(path = %path.display(), records = records.len(), "Slot records written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Polarity;
    use crate::models::{Measurement, RendezvousStrategy};
    use crate::timebase::ManualClock;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Value(f64),
        /// Every run crashed: no samples
        Empty,
        /// Workload could not be spawned
        Fail,
        /// Report a value, but only after the clock jumps to this time
        Stall(f64, f64),
    }

    /// Plays back one step per `measure` call.
    #[derive(Clone)]
    struct ScriptedProbe {
        clock: ManualClock,
        steps: Arc<Mutex<VecDeque<Step>>>,
    }

    impl ScriptedProbe {
        fn new(clock: &ManualClock, steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                clock: clock.clone(),
                steps: Arc::new(Mutex::new(steps.into_iter().collect())),
            }
        }

        fn values(clock: &ManualClock, values: &[f64]) -> Self {
            Self::new(clock, values.iter().map(|v| Step::Value(*v)))
        }
    }

    impl Probe for ScriptedProbe {
        fn polarity(&self) -> Polarity {
            Polarity::LowerIsContended
        }

        async fn measure(&self, _budget: Duration) -> Result<Measurement> {
            let step = self.steps.lock().unwrap().pop_front().expect("script exhausted");
            match step {
                Step::Value(value) => Ok(Measurement { value, samples: 3 }),
                Step::Empty => Ok(Measurement::empty()),
                Step::Fail => Err(ContendError::Spawn {
                    program: PathBuf::from("./simple_stream"),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
                Step::Stall(value, until) => {
                    self.clock.advance_to(Epoch::from_secs(until));
                    Ok(Measurement { value, samples: 1 })
                }
            }
        }
    }

    const START: f64 = 1000.0;
    const BW_900: Threshold = Threshold {
        value: 900.0,
        polarity: Polarity::LowerIsContended,
    };

    fn channel(bits: usize) -> Config {
        let mut config = Config::default();
        config.channel.bits = bits;
        config.rendezvous.strategy = RendezvousStrategy::Quantized;
        config
    }

    fn sensor(config: &Config, probe: ScriptedProbe, clock: &ManualClock) -> Sensor<ManualClock, ScriptedProbe> {
        Sensor::from_config(clock.clone(), probe, config).unwrap()
    }

    #[tokio::test]
    async fn test_scenario_clean_decode() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::values(&clock, &[400.0, 1200.0, 1300.0, 300.0]);
        let s = sensor(&channel(4), probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "1001");
        assert_eq!(report.missed, 0);
        assert_eq!(report.empty, 0);
    }

    #[tokio::test]
    async fn test_scenario_crashed_workload_reads_as_one() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::new(
            &clock,
            [Step::Value(400.0), Step::Value(1200.0), Step::Empty, Step::Value(300.0)],
        );
        let s = sensor(&channel(4), probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "1011");
        assert_eq!(report.empty, 1);
        assert_eq!(report.message.erasures(), 0);
    }

    #[tokio::test]
    async fn test_scenario_missed_window_is_erasure() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        // Slot 2's measurement overruns past the end of slot 3.
        let probe = ScriptedProbe::new(
            &clock,
            [
                Step::Value(400.0),
                Step::Value(1200.0),
                Step::Stall(1300.0, START + 4.2),
            ],
        );
        let s = sensor(&channel(4), probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "100x");
        assert_eq!(report.missed, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_erases_slot() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::new(&clock, [Step::Value(400.0), Step::Fail]);
        let s = sensor(&channel(2), probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "1x");
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_repetition_votes_per_bit() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe =
            ScriptedProbe::values(&clock, &[400.0, 1200.0, 300.0, 1200.0, 1300.0, 400.0]);
        let mut config = channel(2);
        config.channel.repetition = 3;
        let s = sensor(&config, probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.total_slots, 6);
        assert_eq!(report.message.to_string(), "10");
    }

    #[tokio::test]
    async fn test_gather_mode_decodes_in_slot_order() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::values(&clock, &[400.0, 1200.0, 1300.0, 300.0]);
        let mut config = channel(4);
        config.channel.mode = SlotMode::Gather;
        let s = sensor(&config, probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "1001");
    }

    #[tokio::test]
    async fn test_gather_stall_past_later_slot_erases_it() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        // Slot 1's launched measurement runs on past the end of slot 2.
        let probe = ScriptedProbe::new(
            &clock,
            [
                Step::Value(400.0),
                Step::Stall(1200.0, START + 3.2),
                Step::Value(300.0),
            ],
        );
        let mut config = channel(4);
        config.channel.mode = SlotMode::Gather;
        let s = sensor(&config, probe.clone(), &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "10x1");
        assert_eq!(report.missed, 1);
        assert!(probe.steps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gather_over_capacity_rejected_before_calibration() {
        let clock = ManualClock::new(Epoch::from_secs(10.0));
        let probe = ScriptedProbe::values(&clock, &[1000.0]);
        let mut config = channel(4);
        config.channel.mode = SlotMode::Gather;
        config.channel.max_in_flight = 2;
        let s = sensor(&config, probe.clone(), &clock);

        let err = s.run().await.unwrap_err();
        assert!(matches!(err, ContendError::CapacityExceeded { capacity: 2 }));
        assert_eq!(probe.steps.lock().unwrap().len(), 1);
        assert_eq!(clock.now(), Epoch::from_secs(10.0));
    }

    #[tokio::test]
    async fn test_run_calibrates_then_receives() {
        let clock = ManualClock::new(Epoch::from_secs(10.0));
        // First value is the idle baseline.
        let probe = ScriptedProbe::values(&clock, &[1000.0, 400.0, 1200.0]);
        let s = sensor(&channel(2), probe, &clock);
        let report = s.run().await.unwrap();
        assert_eq!(report.baseline, Some(1000.0));
        assert!((report.threshold - 900.0).abs() < 1e-9);
        assert_eq!(report.message.to_string(), "10");
    }

    #[tokio::test]
    async fn test_warmup_discards_one_measurement() {
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::values(&clock, &[5.0, 400.0, 1200.0]);
        let mut config = channel(2);
        config.sensing.warmup_ms = 500;
        let s = sensor(&config, probe, &clock);
        let report = s.receive(Epoch::from_secs(START), BW_900).await.unwrap();
        assert_eq!(report.message.to_string(), "10");
    }

    #[tokio::test]
    async fn test_records_written_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slots.jsonl");
        let clock = ManualClock::new(Epoch::from_secs(990.0));
        let probe = ScriptedProbe::values(&clock, &[400.0, 1200.0]);
        let s = sensor(&channel(2), probe, &clock).with_records(Some(path.clone()));
        s.receive(Epoch::from_secs(START), BW_900).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["slot"], 0);
        assert_eq!(lines[0]["symbol"], "one");
        assert_eq!(lines[1]["outcome"], "measured");
        assert_eq!(lines[1]["symbol"], "zero");
    }
}
