//! `rngcollect record`: run a timed capture to CSV.

use std::io::Write;
use std::path::PathBuf;

use rngcollect_core::session::meta_path;
use rngcollect_core::{Collector, CollectorConfig, SessionConfig, SessionStatus, SessionWriter, record};

use super::{fail, make_descriptor, parse_duration};

pub struct RecordCommandConfig<'a> {
    pub source: &'a str,
    pub bits: usize,
    pub interval: &'a str,
    pub duration: &'a str,
    pub fold: u8,
    pub device: Option<PathBuf>,
    pub output: PathBuf,
    pub note: Option<String>,
}

/// Run the record command.
pub fn run(cfg: RecordCommandConfig<'_>) {
    let descriptor = make_descriptor(cfg.source, cfg.fold, cfg.device).unwrap_or_else(|e| fail(e));
    let interval = parse_duration(cfg.interval).unwrap_or_else(|e| fail(e));
    let duration = parse_duration(cfg.duration).unwrap_or_else(|e| fail(e));
    let kind = descriptor.kind;

    let config = CollectorConfig {
        sample_size_bits: cfg.bits,
        frequency: interval,
        duration,
    };
    let collector = Collector::for_descriptor(descriptor, config).unwrap_or_else(|e| fail(e));

    let samples = collector.subscribe();
    if let Err(e) = collector.start() {
        fail(e);
    }

    let writer = match SessionWriter::new(SessionConfig {
        output_dir: cfg.output,
        source: kind,
        sample_size_bits: cfg.bits,
        interval,
        fold: cfg.fold,
        duration,
        note: cfg.note,
    }) {
        Ok(w) => w,
        Err(e) => {
            let _ = collector.stop();
            fail(format!("creating capture file: {e}"));
        }
    };

    // Ctrl+C stops the session; the recorder then finishes the capture.
    let on_signal = collector.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = on_signal.stop();
    }) {
        log::warn!("could not install Ctrl+C handler: {e}");
    }

    println!("Recording session");
    println!("  Source:    {kind}");
    println!("  Bits:      {}", cfg.bits);
    println!("  Interval:  {}", cfg.interval);
    if duration.is_zero() {
        println!("  Duration:  until Ctrl+C");
    } else {
        println!("  Duration:  {}", cfg.duration);
    }
    if kind.supports_fold() {
        println!("  Fold:      {}", cfg.fold);
    }
    println!("  Output:    {}", writer.csv_path().display());
    println!();

    let driver = collector.spawn().unwrap_or_else(|e| fail(e));

    let result = record(&collector, samples, writer, |sample, snap| {
        let z = snap.stats.z_score.map_or_else(|| "-".to_string(), |z| format!("{z:+.3}"));
        print!(
            "\r  Samples: {:<8} Elapsed: {:>7.1}s  Ones: {:<6} Z: {:<8} {}",
            sample.sequence_number, snap.elapsed_secs, sample.ones_count, z, snap.stats.verdict
        );
        let _ = std::io::stdout().flush();
    });
    let _ = driver.join();

    println!();
    println!();

    let snap = collector.snapshot();
    match snap.status {
        SessionStatus::Failed => {
            eprintln!(
                "Session failed: {}",
                snap.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        status => println!("Session {status} after {:.1}s", snap.elapsed_secs),
    }

    match result {
        Ok(path) => {
            println!("  Samples:   {}", snap.sample_count);
            if let Some(mean) = snap.stats.cumulative_mean {
                println!("  Mean:      {mean:.6}");
            }
            if let (Some(z), Some(p)) = (snap.stats.z_score, snap.stats.p_value) {
                println!("  Z-score:   {z:+.4}  (p = {p:.4})");
            }
            println!("  Verdict:   {}", snap.stats.verdict);
            println!();
            println!("Capture saved to {}", path.display());
            println!("  metadata: {}", meta_path(&path).display());
        }
        Err(e) => fail(format!("writing capture: {e}")),
    }

    if snap.status == SessionStatus::Failed {
        std::process::exit(1);
    }
}
