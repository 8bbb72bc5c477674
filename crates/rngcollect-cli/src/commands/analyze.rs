//! `rngcollect analyze`: replay a capture.

use std::path::Path;

use chrono::Utc;
use rngcollect_core::analysis::{PASS_MAX_ABS_Z, PASS_WITHIN_PERCENT, samples_from_raw, write_trajectory_csv};
use rngcollect_core::session::read_samples;
use rngcollect_core::{Z_THRESHOLD, analyze, parse_capture_name};

use super::fail;

pub fn run(path: &Path, bits: Option<usize>, output: Option<&Path>, json: bool) {
    let name = path.to_str().and_then(|p| parse_capture_name(p).ok());

    let samples = if path.extension().is_some_and(|e| e == "bin") {
        let block_bits = bits
            .or_else(|| name.as_ref().map(|n| n.sample_size_bits))
            .unwrap_or_else(|| fail("raw .bin input needs --bits or a capture-style file name"));
        if block_bits == 0 || block_bits % 8 != 0 {
            fail(format!("block size {block_bits} is not a positive multiple of 8"));
        }
        let bytes = std::fs::read(path).unwrap_or_else(|e| fail(format!("{}: {e}", path.display())));
        let source = name.as_ref().map_or("raw", |n| n.source.as_str());
        samples_from_raw(&bytes, block_bits, source, Utc::now())
    } else {
        read_samples(path).unwrap_or_else(|e| fail(format!("{}: {e}", path.display())))
    };

    let analysis = analyze(&samples).unwrap_or_else(|e| fail(format!("{}: {e}", path.display())));

    if let Some(out) = output {
        write_trajectory_csv(out, &analysis.points).unwrap_or_else(|e| fail(format!("{}: {e}", out.display())));
    }

    if json {
        match serde_json::to_string_pretty(&analysis.summary) {
            Ok(s) => println!("{s}"),
            Err(e) => fail(e),
        }
        return;
    }

    println!("Capture: {}", path.display());
    if let Some(n) = &name {
        let fold = n.fold.map(|f| format!(", fold {f}")).unwrap_or_default();
        println!(
            "  Started {} | source {} | {} bits every {:?}{fold}",
            n.started, n.source, n.sample_size_bits, n.interval
        );
    }
    println!();

    let Some(s) = analysis.summary else {
        println!("  No samples.");
        return;
    };

    println!("  Samples:          {}", s.samples);
    println!("  Mean ones/sample: {:.3} (expected {:.1})", s.mean_ones, s.expected_ones);
    println!("  Mean Z:           {:+.4}", s.mean_z);
    println!("  Max |Z|:          {:.4}", s.max_abs_z);
    println!("  Within ±{Z_THRESHOLD}:     {:.1}%", s.percent_within);
    println!(
        "  Final Z:          {:+.4} (p = {:.4}, {})",
        s.final_z, s.final_p, s.final_verdict
    );
    println!();
    println!(
        "  Assessment: {} (PASS needs >{PASS_WITHIN_PERCENT}% within ±{Z_THRESHOLD} and max |Z| < {PASS_MAX_ABS_Z})",
        s.assessment
    );
    if let Some(out) = output {
        println!("  Trajectory written to {}", out.display());
    }
}
