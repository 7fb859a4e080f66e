//! Role drivers.
//!
//! Provides:
//! - `Modulator`: encodes, rendezvous, and contends slot by slot
//! - `Sensor`: calibrates, rendezvous, measures slot by slot, decodes
//! - `InFlight`: bounded set of launched slot actions for gather mode

mod inflight;
mod modulator;
mod sensor;

pub use inflight::*;
pub use modulator::*;
pub use sensor::*;
