//! RDSEED CPU-instruction source.
//!
//! RDSEED draws from the on-die conditioned entropy source and may report
//! "no value yet" under load. Each 8-byte word gets up to
//! [`CPU_RETRY_BUDGET`] fresh attempts; a failed attempt produces no bytes, so
//! nothing from it can leak into the output.

use crate::source::{CPU_RETRY_BUDGET, EntropySource, RetryPolicy, SourceError, SourceInfo, Transport};

static RDSEED_INFO: SourceInfo = SourceInfo {
    id: "intel",
    name: "Intel RDSEED",
    description: "CPU RDSEED instruction (on-die entropy source)",
    transport: Transport::CpuInstruction,
    supports_fold: false,
};

/// One hardware seed draw.
pub trait SeedInstruction: Send {
    /// Whether the running CPU advertises the instruction.
    fn supported(&self) -> bool;

    /// One draw. `None` when the hardware had no value ready.
    fn step(&mut self) -> Option<u64>;
}

/// The real RDSEED instruction.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rdseed;

impl SeedInstruction for Rdseed {
    fn supported(&self) -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            std::arch::is_x86_feature_detected!("rdseed")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn step(&mut self) -> Option<u64> {
        #[cfg(target_arch = "x86_64")]
        {
            if !self.supported() {
                return None;
            }
            // SAFETY: the rdseed feature was detected at runtime above.
            unsafe { rdseed64() }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rdseed")]
unsafe fn rdseed64() -> Option<u64> {
    let mut value = 0u64;
    // SAFETY: caller guarantees rdseed support; `value` is a valid out pointer.
    let ok = unsafe { core::arch::x86_64::_rdseed64_step(&mut value) };
    (ok == 1).then_some(value)
}

/// RDSEED source, generic over the instruction seam.
pub struct CpuSeedSource<I: SeedInstruction = Rdseed> {
    instr: I,
}

impl CpuSeedSource<Rdseed> {
    pub fn new() -> Self {
        Self { instr: Rdseed }
    }
}

impl Default for CpuSeedSource<Rdseed> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: SeedInstruction> CpuSeedSource<I> {
    pub fn with_instruction(instr: I) -> Self {
        Self { instr }
    }

    fn word(&mut self) -> Result<u64, SourceError> {
        for attempt in 1..=CPU_RETRY_BUDGET {
            if let Some(v) = self.instr.step() {
                return Ok(v);
            }
            log::debug!("rdseed: no value ready (attempt {attempt}/{CPU_RETRY_BUDGET})");
            std::hint::spin_loop();
        }
        Err(SourceError::transient(
            RDSEED_INFO.id,
            "read",
            format!("no seed after {CPU_RETRY_BUDGET} attempts"),
        ))
    }
}

impl<I: SeedInstruction> EntropySource for CpuSeedSource<I> {
    fn info(&self) -> &SourceInfo {
        &RDSEED_INFO
    }

    fn is_available(&self) -> bool {
        self.instr.supported()
    }

    fn collect(&mut self, n_bytes: usize) -> Result<Vec<u8>, SourceError> {
        if !self.instr.supported() {
            return Err(SourceError::unavailable(
                RDSEED_INFO.id,
                "read",
                "CPU does not support RDSEED",
            ));
        }
        let mut out = Vec::with_capacity(n_bytes.next_multiple_of(8));
        while out.len() < n_bytes {
            out.extend_from_slice(&self.word()?.to_le_bytes());
        }
        out.truncate(n_bytes);
        Ok(out)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: CPU_RETRY_BUDGET,
        }
    }
}
