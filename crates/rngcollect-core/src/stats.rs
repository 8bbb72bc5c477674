//! Streaming bias statistics over a sample stream.
//!
//! [`RunningStats`] is a strict left fold over samples in sequence order. Only
//! the exact integer totals are stored; the mean, Z-score and p-value are
//! derived from them on demand, so replaying the same samples always yields
//! bit-identical results regardless of how the stream was chunked.
//!
//! For `n` cumulative bits with `k` ones, under the fair-coin null hypothesis:
//!
//! ```text
//! Z = (k - n/2) / sqrt(n/4) = (2k - n) / sqrt(n)
//! p = erfc(|Z| / sqrt(2))
//! ```

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::sample::Sample;

/// Two-tailed 95% critical value.
pub const Z_THRESHOLD: f64 = 1.96;

/// Quality verdict for the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// |Z| within the threshold.
    Pass,
    /// |Z| beyond the threshold.
    Review,
    /// No bits folded yet.
    InsufficientData,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Review => write!(f, "REVIEW"),
            Self::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
        }
    }
}

/// Why a sample was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    #[error("sample {sequence}: bit count {bit_count} is not a positive multiple of 8")]
    InvalidBitCount { sequence: u64, bit_count: u64 },
    #[error("sample {sequence}: {ones_count} ones exceeds {bit_count} bits")]
    OnesExceedBits {
        sequence: u64,
        ones_count: u64,
        bit_count: u64,
    },
    #[error("sample {sequence}: bit count {got} differs from session sample size {expected}")]
    SampleSizeMismatch { sequence: u64, expected: u64, got: u64 },
    #[error("out-of-order sample: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

// ---------------------------------------------------------------------------
// Pure functions
// ---------------------------------------------------------------------------

/// Z-score of `ones` set bits in `bits` total. `None` when `bits == 0`.
pub fn z_score(ones: u64, bits: u64) -> Option<f64> {
    if bits == 0 {
        return None;
    }
    let excess = 2 * ones as i128 - bits as i128;
    Some(excess as f64 / (bits as f64).sqrt())
}

/// Two-tailed normal p-value for `z`.
pub fn two_tailed_p(z: f64) -> f64 {
    erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Verdict for an optional Z-score.
pub fn verdict_for(z: Option<f64>) -> Verdict {
    match z {
        None => Verdict::InsufficientData,
        Some(z) if z.abs() <= Z_THRESHOLD => Verdict::Pass,
        Some(_) => Verdict::Review,
    }
}

// ---------------------------------------------------------------------------
// Running aggregate
// ---------------------------------------------------------------------------

/// Exact running totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningStats {
    cumulative_ones: u64,
    cumulative_bits: u64,
    sample_count: u64,
    last_sequence: u64,
    sample_size: Option<u64>,
}

/// Serializable view of [`RunningStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sample_count: u64,
    pub cumulative_ones: u64,
    pub cumulative_bits: u64,
    pub cumulative_mean: Option<f64>,
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub verdict: Verdict,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample. On error the aggregate is unchanged.
    pub fn update(&mut self, sample: &Sample) -> Result<(), StatsError> {
        let seq = sample.sequence_number;
        if sample.bit_count == 0 || sample.bit_count % 8 != 0 {
            return Err(StatsError::InvalidBitCount {
                sequence: seq,
                bit_count: sample.bit_count,
            });
        }
        if sample.ones_count > sample.bit_count {
            return Err(StatsError::OnesExceedBits {
                sequence: seq,
                ones_count: sample.ones_count,
                bit_count: sample.bit_count,
            });
        }
        if let Some(expected) = self.sample_size.filter(|&e| e != sample.bit_count) {
            return Err(StatsError::SampleSizeMismatch {
                sequence: seq,
                expected,
                got: sample.bit_count,
            });
        }
        if seq != self.last_sequence + 1 {
            return Err(StatsError::OutOfOrder {
                expected: self.last_sequence + 1,
                got: seq,
            });
        }

        self.cumulative_ones += sample.ones_count;
        self.cumulative_bits += sample.bit_count;
        self.sample_count += 1;
        self.last_sequence = seq;
        self.sample_size = Some(sample.bit_count);
        Ok(())
    }

    /// Fold a whole sequence from scratch.
    pub fn replay<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> Result<Self, StatsError> {
        let mut stats = Self::new();
        for s in samples {
            stats.update(s)?;
        }
        Ok(stats)
    }

    pub fn cumulative_ones(&self) -> u64 {
        self.cumulative_ones
    }

    pub fn cumulative_bits(&self) -> u64 {
        self.cumulative_bits
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn cumulative_mean(&self) -> Option<f64> {
        (self.cumulative_bits > 0).then(|| self.cumulative_ones as f64 / self.cumulative_bits as f64)
    }

    pub fn z_score(&self) -> Option<f64> {
        z_score(self.cumulative_ones, self.cumulative_bits)
    }

    pub fn p_value(&self) -> Option<f64> {
        self.z_score().map(two_tailed_p)
    }

    pub fn verdict(&self) -> Verdict {
        verdict_for(self.z_score())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sample_count: self.sample_count,
            cumulative_ones: self.cumulative_ones,
            cumulative_bits: self.cumulative_bits,
            cumulative_mean: self.cumulative_mean(),
            z_score: self.z_score(),
            p_value: self.p_value(),
            verdict: self.verdict(),
        }
    }
}
