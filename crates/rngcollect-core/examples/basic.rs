//! Basic collection example.
//!
//! Lists the sources present on this machine, draws a few bytes from the
//! software source, then runs a short session and prints its statistics.
//!
//! Run: `cargo run --example basic`

use std::time::Duration;

use rngcollect_core::sources::SourceDescriptor;
use rngcollect_core::{Collector, CollectorConfig, SourceKind, SourceParams, detect_available_sources};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let available = detect_available_sources();
    println!("Sources available: {available:?}");

    let descriptor = SourceDescriptor::new(SourceKind::Pseudo, SourceParams::default());
    let mut src = descriptor.build()?;
    let bytes = src.generate_bytes(16)?;
    src.release()?;
    print!("16 bytes (hex): ");
    for b in &bytes {
        print!("{b:02x}");
    }
    println!();

    let config = CollectorConfig {
        sample_size_bits: 2048,
        frequency: Duration::from_millis(100),
        duration: Duration::from_secs(1),
    };
    let collector = Collector::for_descriptor(descriptor, config)?;
    collector.start()?;
    collector.spawn()?.join().map_err(|_| "driver thread panicked")?;

    let snap = collector.snapshot();
    println!(
        "\nSession {}: {} samples, z = {:?}, verdict {}",
        snap.status, snap.sample_count, snap.stats.z_score, snap.stats.verdict
    );
    Ok(())
}
