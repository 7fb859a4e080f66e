//! Absolute timestamps in clock seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// An absolute point in time, in seconds since the clock's origin.
///
/// The origin depends on the [`ClockSource`](crate::models::ClockSource):
/// boot for the monotonic clock, the Unix epoch for the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(f64);

impl Epoch {
    #[inline]
    pub const fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    #[inline]
    pub const fn as_secs(self) -> f64 {
        self.0
    }

    /// Signed distance `self - earlier` in seconds.
    #[inline]
    pub fn secs_since(self, earlier: Epoch) -> f64 {
        self.0 - earlier.0
    }

    /// Time remaining until `self` as seen from `now`, saturating at zero.
    #[inline]
    pub fn remaining_from(self, now: Epoch) -> Duration {
        Duration::from_secs_f64((self.0 - now.0).max(0.0))
    }

    /// Offset by a signed number of seconds.
    #[inline]
    pub fn offset(self, secs: f64) -> Self {
        Self(self.0 + secs)
    }
}

impl std::ops::Add<Duration> for Epoch {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_secs_f64())
    }
}

impl std::ops::Sub<Duration> for Epoch {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.as_secs_f64())
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}
