//! One timed measurement of a source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conditioning::count_ones;

/// A single collected sample. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Strictly increasing within a run, starting at 1.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub ones_count: u64,
    pub bit_count: u64,
    pub source_id: String,
}

impl Sample {
    /// Summarize `bytes` read from `source_id`.
    pub fn from_bytes(
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        source_id: &str,
        bytes: &[u8],
    ) -> Self {
        Self {
            sequence_number,
            timestamp,
            ones_count: count_ones(bytes),
            bit_count: bytes.len() as u64 * 8,
            source_id: source_id.to_string(),
        }
    }

    pub fn ones_fraction(&self) -> f64 {
        if self.bit_count == 0 {
            return 0.0;
        }
        self.ones_count as f64 / self.bit_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_counts_bits() {
        let s = Sample::from_bytes(1, Utc::now(), "pseudo", &[0xFF, 0x00, 0x0F]);
        assert_eq!(s.bit_count, 24);
        assert_eq!(s.ones_count, 12);
        assert!((s.ones_fraction() - 0.5).abs() < 1e-12);
    }
}
