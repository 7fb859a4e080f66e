//! Decoding raw slot outcomes into the recovered message.
//!
//! Per raw slot: missed or failed slots are erasures; otherwise the
//! measurement is compared with the threshold (strictly, so a value exactly
//! at the threshold reads as ZERO). Per logical bit: R raw symbols are
//! collapsed by majority vote.

use serde::{Deserialize, Serialize};

use crate::models::{ContendError, RecoveredMessage, Result, SlotOutcome, Symbol};

/// Direction in which contention moves the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Throughput sensing: contention lowers the value
    LowerIsContended,
    /// Latency sensing: contention raises the value
    HigherIsContended,
}

/// Decision boundary for one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value: f64,
    pub polarity: Polarity,
}

impl Threshold {
    pub fn new(value: f64, polarity: Polarity) -> Self {
        Self { value, polarity }
    }

    /// Classify one measurement. Pure: depends only on `value` and `self`.
    pub fn classify(&self, value: f64) -> Symbol {
        let contended = match self.polarity {
            Polarity::LowerIsContended => value < self.value,
            Polarity::HigherIsContended => value > self.value,
        };
        Symbol::from_bit(contended)
    }

    /// Raw symbol for one slot outcome.
    pub fn symbol_for(&self, outcome: &SlotOutcome) -> Symbol {
        match outcome {
            SlotOutcome::Measured { measurement } => self.classify(measurement.value),
            SlotOutcome::Missed | SlotOutcome::Failed => Symbol::Erasure,
        }
    }
}

/// Validated odd repetition factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Repetition(usize);

impl Repetition {
    pub const NONE: Self = Self(1);

    pub fn new(r: usize) -> Result<Self> {
        if r == 0 || r % 2 == 0 {
            return Err(ContendError::InvalidInput(format!(
                "repetition factor must be odd, got {r}"
            )));
        }
        Ok(Self(r))
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Logical bit carried by raw slot `raw`.
    pub fn bit_of(self, raw: usize) -> usize {
        raw / self.0
    }

    /// Position of raw slot `raw` inside its codeword.
    pub fn sub_slot_of(self, raw: usize) -> usize {
        raw % self.0
    }

    /// Expand each payload symbol into R identical raw symbols.
    pub fn encode(self, bits: &[Symbol]) -> Vec<Symbol> {
        bits.iter()
            .flat_map(|&b| std::iter::repeat_n(b, self.0))
            .collect()
    }
}

impl TryFrom<usize> for Repetition {
    type Error = ContendError;
    fn try_from(r: usize) -> Result<Self> {
        Self::new(r)
    }
}

impl From<Repetition> for usize {
    fn from(r: Repetition) -> usize {
        r.0
    }
}

/// Majority vote over one codeword.
///
/// ONE if ones exceed half the codeword, ZERO if zeros do, otherwise
/// ERASURE. Erasures count toward neither side, so a codeword with too
/// many erasures to reach a majority is itself erased.
pub fn majority(votes: &[Symbol]) -> Symbol {
    let half = votes.len() / 2;
    let ones = votes.iter().filter(|s| **s == Symbol::One).count();
    let zeros = votes.iter().filter(|s| **s == Symbol::Zero).count();
    if ones > half {
        Symbol::One
    } else if zeros > half {
        Symbol::Zero
    } else {
        Symbol::Erasure
    }
}

/// Collects raw symbols and emits one logical symbol per full codeword.
#[derive(Debug, Clone)]
pub struct VoteAccumulator {
    repetition: Repetition,
    pending: Vec<Symbol>,
}

impl VoteAccumulator {
    pub fn new(repetition: Repetition) -> Self {
        Self {
            repetition,
            pending: Vec::with_capacity(repetition.get()),
        }
    }

    /// Add one raw symbol; returns the voted symbol when the codeword completes.
    pub fn push(&mut self, raw: Symbol) -> Option<Symbol> {
        self.pending.push(raw);
        if self.pending.len() < self.repetition.get() {
            return None;
        }
        let voted = majority(&self.pending);
        self.pending.clear();
        Some(voted)
    }

    /// Raw symbols held for an incomplete codeword.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Session decoder: threshold plus repetition code.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    threshold: Threshold,
    repetition: Repetition,
}

impl Decoder {
    pub fn new(threshold: Threshold, repetition: Repetition) -> Self {
        Self {
            threshold,
            repetition,
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn repetition(&self) -> Repetition {
        self.repetition
    }

    /// Decode raw outcomes in slot order.
    ///
    /// A trailing incomplete codeword is voted over the slots it has; the
    /// missing positions count as erasures.
    pub fn decode(&self, outcomes: &[SlotOutcome]) -> RecoveredMessage {
        let mut acc = VoteAccumulator::new(self.repetition);
        let mut symbols: Vec<Symbol> = outcomes
            .iter()
            .filter_map(|o| acc.push(self.threshold.symbol_for(o)))
            .collect();
        while acc.pending() > 0 {
            if let Some(s) = acc.push(Symbol::Erasure) {
                symbols.push(s);
            }
        }
        RecoveredMessage::new(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Measurement;

    const BW_900: Threshold = Threshold {
        value: 900.0,
        polarity: Polarity::LowerIsContended,
    };

    fn measured(value: f64) -> SlotOutcome {
        SlotOutcome::Measured {
            measurement: Measurement { value, samples: 1 },
        }
    }

    #[test]
    fn test_classify_polarity() {
        assert_eq!(BW_900.classify(400.0), Symbol::One);
        assert_eq!(BW_900.classify(1200.0), Symbol::Zero);

        let latency = Threshold::new(2000.0, Polarity::HigherIsContended);
        assert_eq!(latency.classify(2500.0), Symbol::One);
        assert_eq!(latency.classify(1500.0), Symbol::Zero);
    }

    #[test]
    fn test_value_at_threshold_is_zero() {
        assert_eq!(BW_900.classify(900.0), Symbol::Zero);
        let latency = Threshold::new(2000.0, Polarity::HigherIsContended);
        assert_eq!(latency.classify(2000.0), Symbol::Zero);
    }

    #[test]
    fn test_zero_threshold_is_not_fatal() {
        let degenerate = Threshold::new(0.0, Polarity::LowerIsContended);
        for v in [0.0, 1.0, 1e9] {
            assert_eq!(degenerate.classify(v), Symbol::Zero);
        }
    }

    #[test]
    fn test_classification_is_slot_independent() {
        let values = [400.0, 1200.0, 1300.0, 300.0, 900.0];
        let forward: Vec<_> = values.iter().map(|v| BW_900.classify(*v)).collect();
        let mut backward: Vec<_> = values.iter().rev().map(|v| BW_900.classify(*v)).collect();
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(forward, values.iter().map(|v| BW_900.classify(*v)).collect::<Vec<_>>());
    }

    #[test]
    fn test_missed_slot_is_erasure_regardless_of_threshold() {
        for t in [0.0, 900.0, f64::MAX] {
            let th = Threshold::new(t, Polarity::LowerIsContended);
            assert_eq!(th.symbol_for(&SlotOutcome::Missed), Symbol::Erasure);
            assert_eq!(th.symbol_for(&SlotOutcome::Failed), Symbol::Erasure);
        }
    }

    #[test]
    fn test_majority_two_of_three() {
        use Symbol::*;
        for votes in [[One, One, Zero], [One, Zero, One], [Zero, One, One], [One, One, One]] {
            assert_eq!(majority(&votes), One);
        }
        for votes in [[Zero, Zero, One], [One, Zero, Zero], [Zero, Zero, Zero]] {
            assert_eq!(majority(&votes), Zero);
        }
    }

    #[test]
    fn test_majority_with_erasures() {
        use Symbol::*;
        assert_eq!(majority(&[One, One, Erasure]), One);
        assert_eq!(majority(&[Erasure, Zero, Zero]), Zero);
        // No side reaches a majority: erasure wins over the split vote.
        assert_eq!(majority(&[One, Zero, Erasure]), Erasure);
        assert_eq!(majority(&[Erasure, Erasure, One]), Erasure);
        assert_eq!(majority(&[Erasure]), Erasure);
    }

    #[test]
    fn test_repetition_must_be_odd() {
        assert!(Repetition::new(0).is_err());
        assert!(Repetition::new(2).is_err());
        assert_eq!(Repetition::new(3).unwrap().get(), 3);
    }

    #[test]
    fn test_repetition_encode_and_positions() {
        let r = Repetition::new(3).unwrap();
        let raw = r.encode(&[Symbol::One, Symbol::Zero]);
        assert_eq!(
            raw,
            vec![Symbol::One, Symbol::One, Symbol::One, Symbol::Zero, Symbol::Zero, Symbol::Zero]
        );
        assert_eq!((r.bit_of(4), r.sub_slot_of(4)), (1, 1));
    }

    #[test]
    fn test_decode_scenario_r1() {
        let decoder = Decoder::new(BW_900, Repetition::NONE);
        let outcomes: Vec<_> = [400.0, 1200.0, 1300.0, 300.0].into_iter().map(measured).collect();
        assert_eq!(decoder.decode(&outcomes).to_string(), "1001");
    }

    #[test]
    fn test_decode_r3_corrects_single_flip() {
        let decoder = Decoder::new(BW_900, Repetition::new(3).unwrap());
        let outcomes = vec![
            measured(400.0),
            measured(1200.0), // flipped
            measured(350.0),
            measured(1100.0),
            SlotOutcome::Missed,
            measured(1150.0),
        ];
        assert_eq!(decoder.decode(&outcomes).to_string(), "10");
    }

    #[test]
    fn test_decode_incomplete_codeword_pads_with_erasures() {
        let decoder = Decoder::new(BW_900, Repetition::new(3).unwrap());
        let outcomes = vec![measured(400.0), measured(300.0), measured(1200.0), measured(100.0)];
        assert_eq!(decoder.decode(&outcomes).to_string(), "1x");
    }
}
