//! # rngcollect-core
//!
//! Timed entropy sampling from hardware and software random number generators,
//! with streaming bias statistics.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use rngcollect_core::{Collector, CollectorConfig, SourceDescriptor, SourceKind, SourceParams};
//!
//! let config = CollectorConfig {
//!     sample_size_bits: 2048,
//!     frequency: Duration::from_secs(1),
//!     duration: Duration::from_secs(10),
//! };
//! let descriptor = SourceDescriptor::new(SourceKind::Pseudo, SourceParams::default());
//! let collector = Collector::for_descriptor(descriptor, config).unwrap();
//!
//! let samples = collector.subscribe();
//! collector.start().unwrap();
//! let driver = collector.spawn().unwrap();
//! for sample in samples.iter() {
//!     println!("#{} ones={}", sample.sequence_number, sample.ones_count);
//! }
//! driver.join().unwrap();
//! println!("verdict: {}", collector.stats().verdict());
//! ```
//!
//! ## Architecture
//!
//! Source → Read Worker → Collector (state machine) → Sample stream →
//! RunningStats → (capture file, snapshots)
//!
//! Every backend implements the [`EntropySource`] trait:
//! - **BitBabbler** (USB, XOR-fold whitening 0–4)
//! - **TrueRNG** (serial)
//! - **RDSEED** (CPU instruction, bounded retry)
//! - **OS CSPRNG** (software fallback, always available)
//!
//! A [`Collector`] owns exactly one source per run and reads it on a dedicated
//! worker thread, so a hung device never blocks the control path.

pub mod analysis;
pub mod clock;
pub mod conditioning;
pub mod recorder;
pub mod sample;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod sources;
pub mod stats;
pub mod worker;

pub use analysis::{Analysis, SessionSummary, TrajectoryPoint, analyze};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conditioning::{count_ones, xor_fold};
pub use recorder::record;
pub use sample::Sample;
pub use scheduler::{
    CollectError, Collector, CollectorConfig, SessionSnapshot, SessionStatus, SourceFactory, TickOutcome,
};
pub use session::{CaptureName, SessionConfig, SessionWriter, parse_capture_name};
pub use source::{EntropySource, RetryPolicy, SourceError, SourceInfo, SourceKind, SourceParams, release_or_warn};
pub use sources::{SourceDescriptor, detect_available_sources};
pub use stats::{RunningStats, StatsError, StatsSnapshot, Verdict, Z_THRESHOLD};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
