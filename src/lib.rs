//! contend - covert timing channel over shared-resource contention.
//!
//! ## Architecture
//!
//! Two unprivileged processes, no direct channel:
//! - **Modulator**: contends for a shared resource during ONE slots, idles during ZERO slots
//! - **Sensor**: measures the same resource every slot and decodes by threshold
//!
//! ## Layers
//!
//! TimeBase → Rendezvous → Slot Scheduler → Contention → Calibrator → Decoder → Roles
//!
//! ## Resources
//!
//! - **Bandwidth**: an external workload saturates the memory bus and reports throughput
//! - **Cache**: eviction-set flushes versus cycle-timed accesses to a probe line
//!
//! ## Failure model
//!
//! - Slot-local failures (late wake, spawn failure) erase one symbol
//! - Session-fatal failures (no clock, no eviction buffer) abort the run

pub mod calibrate;
pub mod contention;
pub mod decode;
pub mod models;
pub mod rendezvous;
pub mod schedule;
pub mod session;
pub mod timebase;

// Re-exports for convenience
pub use calibrate::{Calibration, Calibrator};
pub use contention::{Probe, ProbeStrategy, StressStrategy, Stressor};
pub use decode::{Decoder, Polarity, Repetition, Threshold};
pub use models::{
    BitErrorReport, Config, ContendError, ReceiveReport, RecoveredMessage, Result, Symbol,
    TransmitReport,
};
pub use rendezvous::Rendezvous;
pub use schedule::SlotSchedule;
pub use session::{Modulator, Sensor};
pub use timebase::{Clock, Epoch, SystemClock};
