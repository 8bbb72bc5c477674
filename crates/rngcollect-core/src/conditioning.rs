//! Centralized whitening and bit counting.
//!
//! All post-processing of raw device bytes lives here. Sources produce raw
//! bytes and call into this module; nothing else in the crate transforms
//! entropy data.
//!
//! ```text
//! Device → Raw Bytes → xor_fold (this module) → Output → count_ones → Sample
//! ```

use crate::source::MAX_FOLD_LEVEL;

// ---------------------------------------------------------------------------
// XOR fold
// ---------------------------------------------------------------------------

/// Number of raw bytes needed to produce `n_output` bytes at `level`.
pub fn fold_input_len(n_output: usize, level: u8) -> usize {
    n_output << level
}

/// XOR-fold `raw` at `level`.
///
/// Output byte `i` is the XOR of the `2^level` consecutive raw bytes starting
/// at `i * 2^level`. Level 0 is the identity. Trailing bytes that do not fill a
/// whole group are dropped. Levels above [`MAX_FOLD_LEVEL`] are clamped.
pub fn xor_fold(raw: &[u8], level: u8) -> Vec<u8> {
    let level = level.min(MAX_FOLD_LEVEL);
    if level == 0 {
        return raw.to_vec();
    }
    raw.chunks_exact(1usize << level)
        .map(|group| group.iter().fold(0u8, |acc, &b| acc ^ b))
        .collect()
}

// ---------------------------------------------------------------------------
// Bit counting
// ---------------------------------------------------------------------------

/// Total set bits across `bytes`.
pub fn count_ones(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}
