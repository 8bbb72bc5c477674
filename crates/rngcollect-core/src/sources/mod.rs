//! The four entropy source backends and the registry that builds them.

pub mod cpu;
pub mod serial;
pub mod software;
pub mod transport;
pub mod usb;

use crate::source::{EntropySource, SourceError, SourceKind, SourceParams, release_or_warn};

pub use cpu::CpuSeedSource;
pub use serial::TrueRngSource;
pub use software::SoftwareSource;
pub use usb::BitBabblerSource;

/// Every supported variant, hardware first.
pub fn all_kinds() -> &'static [SourceKind] {
    &SourceKind::ALL
}

/// Construct a fresh source instance.
pub fn build(kind: SourceKind, params: &SourceParams) -> Result<Box<dyn EntropySource>, SourceError> {
    params.validate(kind)?;
    Ok(match kind {
        SourceKind::BitBabbler => Box::new(BitBabblerSource::new(params)?),
        SourceKind::TrueRng => Box::new(TrueRngSource::new(params)?),
        SourceKind::IntelSeed => Box::new(CpuSeedSource::new()),
        SourceKind::Pseudo => Box::new(SoftwareSource::new()),
    })
}

/// A buildable source: variant plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub params: SourceParams,
}

impl SourceDescriptor {
    pub fn new(kind: SourceKind, params: SourceParams) -> Self {
        Self { kind, params }
    }

    pub fn id(&self) -> &'static str {
        self.kind.code()
    }

    pub fn build(&self) -> Result<Box<dyn EntropySource>, SourceError> {
        build(self.kind, &self.params)
    }

    /// Build a throwaway instance and probe it.
    pub fn is_available(&self) -> bool {
        match self.build() {
            Ok(mut src) => {
                let available = src.is_available();
                release_or_warn(src.as_mut());
                available
            }
            Err(_) => false,
        }
    }
}

/// Variants whose availability probe currently succeeds with default parameters.
pub fn detect_available_sources() -> Vec<SourceKind> {
    all_kinds()
        .iter()
        .copied()
        .filter(|&k| SourceDescriptor::new(k, SourceParams::default()).is_available())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_always_detected() {
        assert!(detect_available_sources().contains(&SourceKind::Pseudo));
    }

    #[test]
    fn build_matches_kind() {
        for &kind in all_kinds() {
            let src = build(kind, &SourceParams::default()).unwrap();
            assert_eq!(src.id(), kind.code());
        }
    }

    #[test]
    fn build_rejects_fold_on_non_usb() {
        let params = SourceParams {
            fold_level: 2,
            device_path: None,
        };
        assert!(build(SourceKind::Pseudo, &params).is_err());
        assert!(build(SourceKind::BitBabbler, &params).is_ok());
    }
}
