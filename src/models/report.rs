//! Session summaries and bit-error evaluation.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use super::{RecoveredMessage, Symbol};

/// Summary of a modulator session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransmitReport {
    /// Raw slots scheduled (bits × repetition)
    pub total_slots: usize,
    /// Slots that carried contention
    pub contended: usize,
    /// Slots left idle
    pub idle: usize,
    /// Slots skipped because the window had already closed
    pub missed: usize,
    /// Slots whose contention action failed
    pub failed: usize,
    /// Workload instances launched across all slots
    pub launches: usize,
    /// Total runtime in seconds
    pub runtime_secs: f64,
}

/// Summary of a sensor session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveReport {
    /// Idle-channel baseline, absent when the threshold was supplied
    pub baseline: Option<f64>,
    /// Decision threshold in effect
    pub threshold: f64,
    /// Recovered symbols, one per logical bit
    pub message: RecoveredMessage,
    /// Raw slots processed
    pub total_slots: usize,
    /// Raw slots skipped because the window had already closed
    pub missed: usize,
    /// Raw slots whose sensing action failed
    pub failed: usize,
    /// Raw slots measured with zero usable samples
    pub empty: usize,
    /// Total runtime in seconds
    pub runtime_secs: f64,
}

/// Comparison of a transmitted bitstring with a recovered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitErrorReport {
    /// Symbols compared (after truncation to the shorter side)
    pub total: usize,
    /// Positions decoded to the transmitted bit
    pub correct: usize,
    /// Positions decoded to the wrong bit or erased
    pub errors: usize,
    /// Subset of `errors` that were erasures
    pub erasures: usize,
    /// Whether the two inputs had different lengths
    pub truncated: bool,
    /// Indices of every mismatch
    pub error_positions: Vec<usize>,
    /// Transmitted symbols as compared
    pub sent: String,
    /// Received symbols as compared
    pub received: String,
}

/// Positions listed individually up to this many errors.
const MAX_LISTED_ERRORS: usize = 100;

/// Symbols shown in the side-by-side view.
const PREVIEW_LEN: usize = 64;

impl BitErrorReport {
    /// Compare symbol by symbol, truncating to the shorter input.
    pub fn compare(sent: &[Symbol], received: &RecoveredMessage) -> Self {
        let received = received.symbols();
        let total = sent.len().min(received.len());
        let truncated = sent.len() != received.len();

        let mut error_positions = Vec::new();
        let mut erasures = 0;
        for (i, (s, r)) in sent.iter().zip(received).enumerate() {
            if s != r {
                error_positions.push(i);
                if *r == Symbol::Erasure {
                    erasures += 1;
                }
            }
        }

        let render = |symbols: &[Symbol]| -> String {
            symbols[..total].iter().map(|s| s.as_char()).collect()
        };

        Self {
            total,
            correct: total - error_positions.len(),
            errors: error_positions.len(),
            erasures,
            truncated,
            error_positions,
            sent: render(sent),
            received: render(received),
        }
    }

    /// Fraction of compared symbols decoded correctly, in percent.
    pub fn accuracy_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64 * 100.0
    }

    pub fn error_rate_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.errors as f64 / self.total as f64 * 100.0
    }

    /// Render the side-by-side view of the first symbols with a marker row.
    pub fn preview(&self) -> String {
        let n = self.total.min(PREVIEW_LEN);
        let marks: String = self.sent[..n]
            .chars()
            .zip(self.received[..n].chars())
            .map(|(s, r)| if s != r { '^' } else { ' ' })
            .collect();
        let shown = marks.matches('^').count();

        let mut out = String::new();
        let _ = writeln!(out, "  First {n} bits comparison (T=transmitted, R=received):");
        let _ = writeln!(out, "  T: {}", &self.sent[..n]);
        let _ = writeln!(out, "  R: {}", &self.received[..n]);
        let _ = write!(out, "     {marks}  ({shown} errors in first {n})");
        out
    }

    /// Error positions line, or a note when there are none or too many.
    pub fn positions_line(&self) -> String {
        match self.errors {
            0 => "  No errors detected".to_string(),
            n if n <= MAX_LISTED_ERRORS => format!("  Error positions: {:?}", self.error_positions),
            _ => "  (too many errors to list individually)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_bits;

    #[test]
    fn test_compare_counts_erasures_as_errors() {
        let sent = parse_bits("10011").unwrap();
        let received = RecoveredMessage::parse("10x01").unwrap();
        let report = BitErrorReport::compare(&sent, &received);

        assert_eq!(report.total, 5);
        assert_eq!(report.errors, 2);
        assert_eq!(report.erasures, 1);
        assert_eq!(report.error_positions, vec![2, 3]);
        assert!((report.accuracy_percent() - 60.0).abs() < 1e-9);
        assert!(!report.truncated);
    }

    #[test]
    fn test_compare_truncates_to_shorter() {
        let sent = parse_bits("101010").unwrap();
        let received = RecoveredMessage::parse("1010").unwrap();
        let report = BitErrorReport::compare(&sent, &received);
        assert!(report.truncated);
        assert_eq!(report.total, 4);
        assert_eq!(report.errors, 0);
        assert_eq!(report.positions_line(), "  No errors detected");
    }

    #[test]
    fn test_preview_marks_mismatches() {
        let sent = parse_bits("1100").unwrap();
        let received = RecoveredMessage::parse("1000").unwrap();
        let preview = BitErrorReport::compare(&sent, &received).preview();
        assert!(preview.contains("T: 1100"));
        assert!(preview.contains("R: 1000"));
        assert!(preview.contains("^    (1 errors in first 4)"));
    }
}
