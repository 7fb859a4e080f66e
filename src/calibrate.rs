//! Idle-channel calibration.
//!
//! The sensor measures once while the modulator is not yet active and
//! scales that baseline into the session's decision threshold. An explicit
//! threshold skips the measurement entirely. A recoverable measurement
//! failure degrades to an empty baseline instead of ending the session.

use std::time::Duration;

use tracing::{info, warn};

use crate::contention::Probe;
use crate::decode::Threshold;
use crate::models::{Config, Measurement, Result};

/// Outcome of calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Idle-channel measurement; `None` when the threshold was supplied
    pub baseline: Option<f64>,
    pub threshold: Threshold,
}

/// Threshold derived from an idle baseline.
pub fn threshold_from_baseline(baseline: f64, factor: f64) -> f64 {
    baseline * factor
}

#[derive(Debug, Clone)]
pub struct Calibrator {
    duration: Duration,
    factor: f64,
    fixed: Option<f64>,
}

impl Calibrator {
    pub fn new(duration: Duration, factor: f64) -> Self {
        Self {
            duration,
            factor,
            fixed: None,
        }
    }

    /// Use `threshold` as-is instead of measuring.
    pub fn with_threshold(mut self, threshold: Option<f64>) -> Self {
        self.fixed = threshold;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.sensing.calibration_ms),
            config.sensing.effective_factor(),
        )
        .with_threshold(config.threshold_override())
    }

    pub async fn calibrate<P: Probe>(&self, probe: &P) -> Result<Calibration> {
        let polarity = probe.polarity();
        if let Some(value) = self.fixed {
            info!(threshold = value, "Using supplied threshold; calibration skipped");
            return Ok(Calibration {
                baseline: None,
                threshold: Threshold::new(value, polarity),
            });
        }

        info!(duration_ms = self.duration.as_millis() as u64, "Calibrating on idle channel");
        let measurement = match probe.measure(self.duration).await {
            Ok(m) => m,
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "Calibration measurement failed");
                Measurement::empty()
            }
            Err(e) => return Err(e),
        };
        let baseline = measurement.value;
        if measurement.is_empty() || baseline <= 0.0 {
            warn!(
                samples = measurement.samples,
                "Calibration produced no baseline; threshold collapses to 0"
            );
        }

        let threshold = threshold_from_baseline(baseline, self.factor);
        info!(
            baseline,
            factor = self.factor,
            threshold,
            samples = measurement.samples,
            "Calibration complete"
        );
        Ok(Calibration {
            baseline: Some(baseline),
            threshold: Threshold::new(threshold, polarity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Polarity;
    use crate::models::ContendError;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct FixedProbe {
        value: f64,
        samples: u32,
        calls: Arc<AtomicUsize>,
    }

    impl FixedProbe {
        fn new(value: f64, samples: u32) -> Self {
            Self {
                value,
                samples,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Probe for FixedProbe {
        fn polarity(&self) -> Polarity {
            Polarity::LowerIsContended
        }

        async fn measure(&self, _budget: Duration) -> Result<Measurement> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Measurement {
                value: self.value,
                samples: self.samples,
            })
        }
    }

    #[tokio::test]
    async fn test_baseline_times_factor() {
        let probe = FixedProbe::new(1000.0, 5);
        let cal = Calibrator::new(Duration::from_secs(2), 0.9)
            .calibrate(&probe)
            .await
            .unwrap();
        assert_eq!(cal.baseline, Some(1000.0));
        assert!((cal.threshold.value - 900.0).abs() < 1e-9);
        assert_eq!(cal.threshold.polarity, Polarity::LowerIsContended);
    }

    #[tokio::test]
    async fn test_supplied_threshold_skips_measurement() {
        let probe = FixedProbe::new(1000.0, 5);
        let cal = Calibrator::new(Duration::from_secs(2), 0.9)
            .with_threshold(Some(750.0))
            .calibrate(&probe)
            .await
            .unwrap();
        assert_eq!(cal.baseline, None);
        assert_eq!(cal.threshold.value, 750.0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_baseline_collapses_threshold() {
        let probe = FixedProbe::new(0.0, 0);
        let cal = Calibrator::new(Duration::from_secs(2), 0.9)
            .calibrate(&probe)
            .await
            .unwrap();
        assert_eq!(cal.threshold.value, 0.0);
    }

    /// Fails every measurement with the given error.
    #[derive(Clone)]
    struct FailingProbe(fn() -> ContendError);

    impl Probe for FailingProbe {
        fn polarity(&self) -> Polarity {
            Polarity::LowerIsContended
        }

        async fn measure(&self, _budget: Duration) -> Result<Measurement> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_degrades_to_empty_baseline() {
        let probe = FailingProbe(|| ContendError::Spawn {
            program: PathBuf::from("/nonexistent/simple_stream"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        let cal = Calibrator::new(Duration::from_millis(50), 0.9)
            .calibrate(&probe)
            .await
            .unwrap();
        assert_eq!(cal.baseline, Some(0.0));
        assert_eq!(cal.threshold.value, 0.0);
        assert_eq!(cal.threshold.polarity, Polarity::LowerIsContended);
    }

    #[tokio::test]
    async fn test_fatal_measurement_error_propagates() {
        let probe = FailingProbe(|| ContendError::Unsupported("rdtsc".into()));
        let err = Calibrator::new(Duration::from_millis(50), 0.9)
            .calibrate(&probe)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_config_override_reaches_calibrator() {
        let mut config = Config::default();
        config.sensing.threshold = Some(123.0);
        let cal = Calibrator::from_config(&config);
        assert_eq!(cal.fixed, Some(123.0));
        assert!((cal.factor - 0.9).abs() < 1e-12);
    }
}
