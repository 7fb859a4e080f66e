//! Time base shared by both roles.
//!
//! Provides:
//! - `Epoch`: absolute timestamp in clock seconds
//! - `Clock`: `now()` plus `sleep_until()`
//! - `SystemClock` / `ManualClock`: real and virtual implementations

mod clock;
mod epoch;

pub use clock::*;
pub use epoch::*;
