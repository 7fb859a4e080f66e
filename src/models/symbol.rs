//! Channel data types: symbols, measurements and per-slot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ContendError, Result};

/// One transmitted or recovered symbol.
///
/// `Erasure` means no valid symbol was observed. It is never coerced to
/// a binary value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Symbol {
    Zero,
    One,
    Erasure,
}

impl Symbol {
    /// Character used in rendered messages.
    pub fn as_char(self) -> char {
        match self {
            Self::Zero => '0',
            Self::One => '1',
            Self::Erasure => 'x',
        }
    }

    pub fn from_bit(bit: bool) -> Self {
        if bit { Self::One } else { Self::Zero }
    }

    /// Parse a rendered symbol; accepts `x` or `X` for erasures.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Zero),
            '1' => Some(Self::One),
            'x' | 'X' => Some(Self::Erasure),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Parse a payload bitstring; only `0` and `1` are accepted.
pub fn parse_bits(bits: &str) -> Result<Vec<Symbol>> {
    let bits = bits.trim();
    if bits.is_empty() {
        return Err(ContendError::InvalidInput("empty bitstring".to_string()));
    }
    bits.chars()
        .enumerate()
        .map(|(i, c)| match c {
            '0' => Ok(Symbol::Zero),
            '1' => Ok(Symbol::One),
            other => Err(ContendError::InvalidInput(format!(
                "bit {i}: expected '0' or '1', found {other:?}"
            ))),
        })
        .collect()
}

/// Aggregated measurement for one raw slot.
///
/// A slot in which no run produced a usable value has `samples == 0` and
/// `value == 0.0`. It still decodes by the ordinary threshold comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Mean of all captured samples (throughput or scaled cycles)
    pub value: f64,
    /// Number of samples that contributed
    pub samples: u32,
}

impl Measurement {
    /// The "no sample" sentinel.
    pub const fn empty() -> Self {
        Self {
            value: 0.0,
            samples: 0,
        }
    }

    /// Average a set of samples, yielding the sentinel for an empty set.
    pub fn mean_of(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::empty();
        }
        Self {
            value: samples.iter().sum::<f64>() / samples.len() as f64,
            samples: samples.len() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// What happened in a raw slot on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SlotOutcome {
    /// A measurement was taken inside the window
    Measured { measurement: Measurement },
    /// The scheduler woke after the window closed
    Missed,
    /// The sensing action itself failed (e.g. spawn failure)
    Failed,
}

impl SlotOutcome {
    pub fn measurement(&self) -> Option<Measurement> {
        match self {
            Self::Measured { measurement } => Some(*measurement),
            _ => None,
        }
    }
}

/// Diagnostic record for one raw slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Raw slot index
    pub slot: usize,
    /// Logical bit this slot contributes to
    pub bit: usize,
    /// Position within the repetition codeword
    pub sub_slot: usize,
    /// Scheduled slot start (clock seconds)
    pub scheduled_at: f64,
    #[serde(flatten)]
    pub outcome: SlotOutcome,
    /// Raw symbol before voting
    pub symbol: Symbol,
    /// Wall-clock time the record was produced
    pub recorded_at: DateTime<Utc>,
}

/// Final decoder output, one symbol per logical bit, in slot order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveredMessage(Vec<Symbol>);

impl RecoveredMessage {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self(symbols)
    }

    /// Parse a rendered message (`0`, `1`, `x`).
    pub fn parse(s: &str) -> Result<Self> {
        s.trim()
            .chars()
            .map(|c| {
                Symbol::from_char(c).ok_or_else(|| {
                    ContendError::ParseError(format!("unexpected symbol {c:?} in message"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn erasures(&self) -> usize {
        self.0.iter().filter(|s| **s == Symbol::Erasure).count()
    }
}

impl fmt::Display for RecoveredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for symbol in &self.0 {
            write!(f, "{symbol}")?;
        }
        Ok(())
    }
}
