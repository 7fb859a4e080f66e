//! Configuration models for contend.
//!
//! Every session parameter is resolvable here: from a TOML file, from
//! defaults, and finally from CLI overrides applied by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a channel session.
///
/// Both roles must load equivalent `[channel]` and `[rendezvous]` sections,
/// otherwise their slot grids disagree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Slot grid and decoding parameters
    #[serde(default)]
    pub channel: ChannelConfig,

    /// How the two roles agree on a start time
    #[serde(default)]
    pub rendezvous: RendezvousConfig,

    /// Receiver-side sensing
    #[serde(default)]
    pub sensing: SensingConfig,

    /// Sender-side modulation
    #[serde(default)]
    pub modulation: ModulationConfig,

    /// External bandwidth workload
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Eviction set and cache probe geometry
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Slot grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Slot duration D in milliseconds
    #[serde(default = "default_slot_ms")]
    pub slot_ms: u64,

    /// Number of logical bits N the receiver expects
    #[serde(default = "default_bits")]
    pub bits: usize,

    /// Repetition factor R (odd)
    #[serde(default = "default_repetition")]
    pub repetition: usize,

    /// Wake-up offset after a slot boundary, as a fraction of D
    #[serde(default = "default_guard_fraction")]
    pub guard_fraction: f64,

    /// Dead time before the next slot boundary, as a fraction of D
    #[serde(default = "default_trailing_guard_fraction")]
    pub trailing_guard_fraction: f64,

    /// Blocking slot loop or launch-then-gather
    #[serde(default)]
    pub mode: SlotMode,

    /// Upper bound on concurrently launched slot actions (gather mode)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Clock used for rendezvous and scheduling
    #[serde(default)]
    pub clock: ClockSource,
}

fn default_slot_ms() -> u64 {
    1000
}

fn default_bits() -> usize {
    16
}

fn default_repetition() -> usize {
    1
}

fn default_guard_fraction() -> f64 {
    0.01
}

fn default_trailing_guard_fraction() -> f64 {
    0.05
}

fn default_max_in_flight() -> usize {
    1024
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            slot_ms: default_slot_ms(),
            bits: default_bits(),
            repetition: default_repetition(),
            guard_fraction: default_guard_fraction(),
            trailing_guard_fraction: default_trailing_guard_fraction(),
            mode: SlotMode::default(),
            max_in_flight: default_max_in_flight(),
            clock: ClockSource::default(),
        }
    }
}

impl ChannelConfig {
    /// Slot duration as a [`Duration`].
    pub fn slot_duration(&self) -> Duration {
        Duration::from_millis(self.slot_ms)
    }
}

/// How slot actions are driven within a role.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    /// Act on each slot in turn, waiting for completion
    #[default]
    Blocking,
    /// Launch every slot action on schedule, collect all results at the end
    Gather,
}

/// Where `now()` comes from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// System-wide CLOCK_MONOTONIC, shared by processes on one host
    #[default]
    Monotonic,
    /// UTC wall clock, for roles on hosts with synchronized clocks
    Wall,
}

/// Rendezvous configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Strategy shared by both roles
    #[serde(default)]
    pub strategy: RendezvousStrategy,

    /// Location of the start-time artifact
    #[serde(default = "default_artifact_path")]
    pub path: PathBuf,

    /// Lead between publishing the artifact and slot 0
    #[serde(default = "default_lead_ms")]
    pub lead_ms: u64,

    /// Interval between artifact polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Quantum Q for clock quantization
    #[serde(default = "default_quantum_secs")]
    pub quantum_secs: u64,

    /// Give up waiting for the artifact after this long (unbounded if unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("/tmp/covert_start")
}

fn default_lead_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_quantum_secs() -> u64 {
    60
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            strategy: RendezvousStrategy::default(),
            path: default_artifact_path(),
            lead_ms: default_lead_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            quantum_secs: default_quantum_secs(),
            timeout_secs: None,
        }
    }
}

/// Rendezvous strategy selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RendezvousStrategy {
    /// Modulator publishes the start time in a shared file
    #[default]
    Artifact,
    /// Both roles round up to the next multiple of a quantum
    Quantized,
}

/// Receiver-side sensing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensingConfig {
    /// Sensing primitive
    #[serde(default)]
    pub strategy: SensingStrategy,

    /// Explicit decision threshold; skips calibration entirely
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Length of the idle-channel baseline measurement
    #[serde(default = "default_calibration_ms")]
    pub calibration_ms: u64,

    /// Multiplier applied to the baseline (strategy default if unset)
    #[serde(default)]
    pub factor: Option<f64>,

    /// Discarded measurement right before slot 0 (0 disables)
    #[serde(default)]
    pub warmup_ms: u64,
}

fn default_calibration_ms() -> u64 {
    2000
}

impl Default for SensingConfig {
    fn default() -> Self {
        Self {
            strategy: SensingStrategy::default(),
            threshold: None,
            calibration_ms: default_calibration_ms(),
            factor: None,
            warmup_ms: 0,
        }
    }
}

impl SensingConfig {
    /// Baseline multiplier, falling back to the strategy's default.
    ///
    /// Bandwidth drops under contention, so its factor sits below 1.
    /// Latency rises under contention, so its factor sits above 1.
    pub fn effective_factor(&self) -> f64 {
        self.factor.unwrap_or(match self.strategy {
            SensingStrategy::Bandwidth => 0.9,
            SensingStrategy::Cache => 1.1,
        })
    }
}

/// Sensing strategy selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensingStrategy {
    /// Run the workload and average its reported throughput
    #[default]
    Bandwidth,
    /// Time repeated accesses to a probe line with the cycle counter
    Cache,
}

/// Sender-side modulation configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulationConfig {
    /// Contention primitive
    #[serde(default)]
    pub strategy: ModulationStrategy,

    /// Start contention this early when slot 0 carries a one
    #[serde(default)]
    pub preroll_ms: u64,
}

/// Modulation strategy selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModulationStrategy {
    /// Keep a pool of workload instances running
    #[default]
    Workload,
    /// Flush the eviction set on a fixed cadence
    Cache,
}

/// External workload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Program to execute
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Label preceding the throughput value in the program's output
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Concurrent instances kept alive while modulating a one
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_program() -> PathBuf {
    PathBuf::from("./simple_stream")
}

fn default_marker() -> String {
    "Copy:".to_string()
}

fn default_pool_size() -> usize {
    2
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            marker: default_marker(),
            pool_size: default_pool_size(),
        }
    }
}

/// Cache geometry and probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of addresses in the eviction set
    #[serde(default = "default_ways")]
    pub ways: usize,

    /// Distance between eviction-set addresses in bytes
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Pause between flush rounds while modulating a one
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Accesses timed per probe trial
    #[serde(default = "default_probe_accesses")]
    pub probe_accesses: u64,

    /// Divisor applied to each trial's cycle delta
    #[serde(default = "default_probe_scale")]
    pub probe_scale: u64,

    /// Absolute latency threshold in scaled cycles; overrides calibration
    #[serde(default)]
    pub threshold_cycles: Option<f64>,
}

fn default_ways() -> usize {
    12
}

fn default_stride() -> usize {
    2 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    500
}

fn default_probe_accesses() -> u64 {
    100_000
}

fn default_probe_scale() -> u64 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ways: default_ways(),
            stride: default_stride(),
            flush_interval_ms: default_flush_interval_ms(),
            probe_accesses: default_probe_accesses(),
            probe_scale: default_probe_scale(),
            threshold_cycles: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Explicit threshold for the selected sensing strategy, if any.
    ///
    /// `sensing.threshold` wins over `cache.threshold_cycles`.
    pub fn threshold_override(&self) -> Option<f64> {
        match self.sensing.strategy {
            SensingStrategy::Bandwidth => self.sensing.threshold,
            SensingStrategy::Cache => self.sensing.threshold.or(self.cache.threshold_cycles),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ch = &self.channel;
        if ch.slot_ms == 0 {
            return Err(ConfigError::Invalid("channel.slot_ms must be > 0".into()));
        }
        if ch.bits == 0 {
            return Err(ConfigError::Invalid("channel.bits must be >= 1".into()));
        }
        if ch.repetition == 0 || ch.repetition % 2 == 0 {
            return Err(ConfigError::Invalid(format!(
                "channel.repetition must be odd, got {}",
                ch.repetition
            )));
        }
        let guards = [ch.guard_fraction, ch.trailing_guard_fraction];
        if guards.iter().any(|g| !(0.0..1.0).contains(g)) || guards.iter().sum::<f64>() >= 1.0 {
            return Err(ConfigError::Invalid(
                "guard fractions must lie in [0, 1) and leave part of the slot usable".into(),
            ));
        }
        if ch.max_in_flight == 0 {
            return Err(ConfigError::Invalid("channel.max_in_flight must be >= 1".into()));
        }

        if self.rendezvous.strategy == RendezvousStrategy::Artifact
            && self.rendezvous.lead_ms < ch.slot_ms
        {
            return Err(ConfigError::Invalid(
                "rendezvous.lead_ms must be at least one slot".into(),
            ));
        }
        if self.rendezvous.strategy == RendezvousStrategy::Quantized
            && self.rendezvous.quantum_secs == 0
        {
            return Err(ConfigError::Invalid("rendezvous.quantum_secs must be > 0".into()));
        }

        let factor = self.sensing.effective_factor();
        if !(factor.is_finite() && factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sensing.factor must be positive, got {factor}"
            )));
        }

        if self.workload.pool_size == 0 {
            return Err(ConfigError::Invalid("workload.pool_size must be >= 1".into()));
        }

        let cache = &self.cache;
        if cache.ways == 0 {
            return Err(ConfigError::Invalid("cache.ways must be >= 1".into()));
        }
        if cache.stride < 64 || cache.stride % 64 != 0 {
            return Err(ConfigError::Invalid(format!(
                "cache.stride must be a multiple of the 64-byte line, got {}",
                cache.stride
            )));
        }
        if cache.probe_accesses == 0 || cache.probe_scale == 0 {
            return Err(ConfigError::Invalid(
                "cache.probe_accesses and cache.probe_scale must be > 0".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
