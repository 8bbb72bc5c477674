//! Operating system CSPRNG fallback.

use crate::source::{EntropySource, SourceError, SourceInfo, Transport};

static SOFTWARE_INFO: SourceInfo = SourceInfo {
    id: "pseudo",
    name: "OS CSPRNG",
    description: "Operating system cryptographic random number generator",
    transport: Transport::Software,
    supports_fold: false,
};

/// Always-available source backed by `getrandom`.
#[derive(Debug, Default)]
pub struct SoftwareSource;

impl SoftwareSource {
    pub fn new() -> Self {
        Self
    }
}

impl EntropySource for SoftwareSource {
    fn info(&self) -> &SourceInfo {
        &SOFTWARE_INFO
    }

    fn is_available(&self) -> bool {
        true
    }

    fn collect(&mut self, n_bytes: usize) -> Result<Vec<u8>, SourceError> {
        let mut buf = vec![0u8; n_bytes];
        getrandom::fill(&mut buf)
            .map_err(|e| SourceError::device(SOFTWARE_INFO.id, "collect", e.to_string()))?;
        Ok(buf)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_bits_for_many_sizes() {
        let mut src = SoftwareSource::new();
        for n in (8..=4096).step_by(8) {
            assert_eq!(src.generate_exact_bits(n).unwrap().len(), n / 8);
        }
    }

    #[test]
    fn random_int_stays_in_range() {
        let mut src = SoftwareSource::new();
        for _ in 0..2000 {
            let v = src.random_int(0, 100).unwrap();
            assert!((0..100).contains(&v));
        }
        for _ in 0..200 {
            let v = src.random_int(-3, 2).unwrap();
            assert!((-3..2).contains(&v));
        }
    }

    #[test]
    fn release_is_idempotent() {
        let mut src = SoftwareSource::new();
        assert!(src.release().is_ok());
        assert!(src.release().is_ok());
        assert!(src.is_available());
    }
}
