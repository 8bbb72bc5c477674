//! Entropy source contract and shared metadata.
//!
//! Every backend implements the [`EntropySource`] trait. Implementors supply
//! availability probing, a raw byte read and resource release; the trait
//! layers the exact-length, bit-granular and integer helpers on top so every
//! variant enforces the same length contracts.

use std::path::PathBuf;

/// Highest supported XOR-fold level.
pub const MAX_FOLD_LEVEL: u8 = 4;

/// Attempts per read for sources whose failures are transient by nature.
pub const CPU_RETRY_BUDGET: u32 = 3;

/// The four supported source variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// BitBabbler USB device with XOR-fold whitening.
    BitBabbler,
    /// TrueRNG serial device.
    TrueRng,
    /// RDSEED CPU instruction.
    IntelSeed,
    /// Operating system CSPRNG.
    Pseudo,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::BitBabbler,
        SourceKind::TrueRng,
        SourceKind::IntelSeed,
        SourceKind::Pseudo,
    ];

    /// Short code used in capture names and on the command line.
    pub fn code(self) -> &'static str {
        match self {
            Self::BitBabbler => "bitb",
            Self::TrueRng => "trng",
            Self::IntelSeed => "intel",
            Self::Pseudo => "pseudo",
        }
    }

    /// Resolve a short code or a long name (case-insensitive).
    pub fn from_code(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bitb" | "bitbabbler" => Some(Self::BitBabbler),
            "trng" | "truerng" => Some(Self::TrueRng),
            "intel" | "rdseed" | "intel-seed" => Some(Self::IntelSeed),
            "pseudo" | "os" | "software" => Some(Self::Pseudo),
            _ => None,
        }
    }

    /// Only the USB variant whitens by folding.
    pub fn supports_fold(self) -> bool {
        matches!(self, Self::BitBabbler)
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// How a source reaches its noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Serial,
    Usb,
    CpuInstruction,
    Software,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Usb => write!(f, "usb"),
            Self::CpuInstruction => write!(f, "cpu"),
            Self::Software => write!(f, "software"),
        }
    }
}

/// Static metadata about a source variant.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    /// Short identifier (e.g. `"bitb"`).
    pub id: &'static str,
    /// Human-readable device name.
    pub name: &'static str,
    /// One-line description.
    pub description: &'static str,
    pub transport: Transport,
    pub supports_fold: bool,
}

/// Variant parameters chosen when a source is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceParams {
    /// XOR-fold level, 0 to [`MAX_FOLD_LEVEL`]. Ignored by variants that do not fold.
    pub fold_level: u8,
    /// Explicit device node or serial port. Auto-discovered when `None`.
    pub device_path: Option<PathBuf>,
}

impl SourceParams {
    pub fn validate(&self, kind: SourceKind) -> Result<(), SourceError> {
        if self.fold_level > MAX_FOLD_LEVEL {
            return Err(SourceError::InvalidArgument {
                source_id: kind.code().to_string(),
                operation: "configure",
                reason: format!(
                    "fold level {} outside 0..={MAX_FOLD_LEVEL}",
                    self.fold_level
                ),
            });
        }
        if self.fold_level > 0 && !kind.supports_fold() {
            return Err(SourceError::InvalidArgument {
                source_id: kind.code().to_string(),
                operation: "configure",
                reason: "fold level only applies to the bitbabbler source".into(),
            });
        }
        Ok(())
    }
}

/// How many times a read may be attempted before the failure escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// One attempt: any failure escalates immediately.
    pub const IMMEDIATE: RetryPolicy = RetryPolicy { max_attempts: 1 };
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::IMMEDIATE
    }
}

/// Failures surfaced by entropy sources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("{source_id}: {operation}: invalid argument: {reason}")]
    InvalidArgument {
        source_id: String,
        operation: &'static str,
        reason: String,
    },
    #[error("{source_id}: {operation}: device unavailable: {reason}")]
    DeviceUnavailable {
        source_id: String,
        operation: &'static str,
        reason: String,
    },
    #[error("{source_id}: {operation}: device error: {cause}")]
    DeviceError {
        source_id: String,
        operation: &'static str,
        cause: String,
        transient: bool,
    },
    #[error("{source_id}: {operation}: release failed: {cause}")]
    ResourceRelease {
        source_id: String,
        operation: &'static str,
        cause: String,
    },
}

impl SourceError {
    pub fn invalid(source_id: &str, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            source_id: source_id.to_string(),
            operation,
            reason: reason.into(),
        }
    }

    pub fn unavailable(source_id: &str, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            source_id: source_id.to_string(),
            operation,
            reason: reason.into(),
        }
    }

    pub fn device(source_id: &str, operation: &'static str, cause: impl Into<String>) -> Self {
        Self::DeviceError {
            source_id: source_id.to_string(),
            operation,
            cause: cause.into(),
            transient: false,
        }
    }

    pub fn transient(source_id: &str, operation: &'static str, cause: impl Into<String>) -> Self {
        Self::DeviceError {
            source_id: source_id.to_string(),
            operation,
            cause: cause.into(),
            transient: true,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceError { transient: true, .. })
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::InvalidArgument { source_id, .. }
            | Self::DeviceUnavailable { source_id, .. }
            | Self::DeviceError { source_id, .. }
            | Self::ResourceRelease { source_id, .. } => source_id,
        }
    }
}

/// Trait that every entropy source must implement.
///
/// A source is exclusively owned by one collection session and moved into that
/// session's read worker, hence `Send` but not `Sync`.
pub trait EntropySource: Send {
    /// Static metadata.
    fn info(&self) -> &SourceInfo;

    /// Fast, side-effect-free probe. Must never block on a device read.
    fn is_available(&self) -> bool;

    /// Why [`is_available`](Self::is_available) said no, when the source can tell.
    fn unavailable_reason(&self) -> Option<String> {
        None
    }

    /// Read up to `n_bytes` bytes. Implementations should return exactly
    /// `n_bytes`; callers use [`generate_bytes`](Self::generate_bytes), which
    /// rejects short reads.
    fn collect(&mut self, n_bytes: usize) -> Result<Vec<u8>, SourceError>;

    /// Drop any held device handle. Idempotent.
    fn release(&mut self) -> Result<(), SourceError>;

    /// Retry budget for transient read failures.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::IMMEDIATE
    }

    /// Convenience: identifier from info.
    fn id(&self) -> &'static str {
        self.info().id
    }

    /// Exactly `n` bytes, or an error. Never a partial buffer.
    fn generate_bytes(&mut self, n: usize) -> Result<Vec<u8>, SourceError> {
        if n == 0 {
            return Err(SourceError::invalid(
                self.id(),
                "generate_bytes",
                "byte count must be positive",
            ));
        }
        let bytes = self.collect(n)?;
        if bytes.len() != n {
            return Err(SourceError::device(
                self.id(),
                "generate_bytes",
                format!("short read: wanted {n} bytes, got {}", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Exactly `n_bits / 8` bytes. `n_bits` must be a positive multiple of 8.
    fn generate_exact_bits(&mut self, n_bits: usize) -> Result<Vec<u8>, SourceError> {
        if n_bits == 0 || n_bits % 8 != 0 {
            return Err(SourceError::invalid(
                self.id(),
                "generate_exact_bits",
                format!("bit count {n_bits} is not a positive multiple of 8"),
            ));
        }
        self.generate_bytes(n_bits / 8)
    }

    /// At least `n_bits` bits, rounded up to whole bytes.
    fn generate_at_least_bits(&mut self, n_bits: usize) -> Result<Vec<u8>, SourceError> {
        if n_bits == 0 {
            return Err(SourceError::invalid(
                self.id(),
                "generate_at_least_bits",
                "bit count must be positive",
            ));
        }
        self.generate_bytes(n_bits.div_ceil(8))
    }

    /// Uniform integer in `[min, max_exclusive)` by rejection sampling.
    ///
    /// Each candidate is read over the minimum whole-byte width covering the
    /// range, masked to the minimum bit width, and discarded when it is not
    /// below the range.
    fn random_int(&mut self, min: i64, max_exclusive: i64) -> Result<i64, SourceError> {
        if max_exclusive <= min {
            return Err(SourceError::invalid(
                self.id(),
                "random_int",
                format!("empty range [{min}, {max_exclusive})"),
            ));
        }
        let range = max_exclusive.abs_diff(min);
        let bits = if range <= 1 {
            1
        } else {
            64 - (range - 1).leading_zeros()
        };
        let n_bytes = bits.div_ceil(8) as usize;
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };

        loop {
            let bytes = self.generate_bytes(n_bytes)?;
            let candidate = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64) & mask;
            if candidate < range {
                return Ok(min.wrapping_add_unsigned(candidate));
            }
        }
    }
}

/// Release `source`, logging a failure instead of returning it.
/// Returns whether the release succeeded.
pub fn release_or_warn(source: &mut dyn EntropySource) -> bool {
    match source.release() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("{e}");
            false
        }
    }
}
