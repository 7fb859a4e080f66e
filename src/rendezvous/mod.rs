//! Rendezvous: agreeing on slot 0's start time without a direct channel.
//!
//! Provides:
//! - `ArtifactRendezvous`: modulator publishes, sensor polls a shared file
//! - `QuantizedRendezvous`: both roles round up to a shared time quantum
//! - `Rendezvous`: the strategy both roles select from configuration

mod artifact;
mod quantize;

pub use artifact::*;
pub use quantize::*;

use crate::models::{Config, RendezvousStrategy, Result};
use crate::timebase::{Clock, Epoch};

/// Rendezvous strategy; both roles must pick the same variant.
#[derive(Debug, Clone)]
pub enum Rendezvous {
    Artifact(ArtifactRendezvous),
    Quantized(QuantizedRendezvous),
}

impl Rendezvous {
    pub fn from_config(config: &Config) -> Self {
        match config.rendezvous.strategy {
            RendezvousStrategy::Artifact => {
                Self::Artifact(ArtifactRendezvous::from_config(&config.rendezvous))
            }
            RendezvousStrategy::Quantized => Self::Quantized(QuantizedRendezvous::from_config(
                &config.rendezvous,
                config.channel.slot_duration(),
            )),
        }
    }

    /// Establish the start time as the modulator.
    ///
    /// With the artifact strategy the returned guard owns the artifact; keep
    /// it alive for the whole session.
    pub fn establish_as_modulator<C: Clock>(
        &self,
        clock: &C,
    ) -> Result<(Epoch, Option<ArtifactGuard>)> {
        match self {
            Self::Artifact(a) => {
                let (start, guard) = a.publish(clock)?;
                Ok((start, Some(guard)))
            }
            Self::Quantized(q) => Ok((q.start(clock), None)),
        }
    }

    /// Establish the start time as the sensor.
    pub async fn establish_as_sensor<C: Clock>(&self, clock: &C) -> Result<Epoch> {
        match self {
            Self::Artifact(a) => a.wait(clock).await,
            Self::Quantized(q) => Ok(q.start(clock)),
        }
    }
}
