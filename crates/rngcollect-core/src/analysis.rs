//! Offline replay of recorded captures.
//!
//! Replays a capture through [`RunningStats`] to produce the Z-score
//! trajectory the live session saw, plus a summary assessment over the whole
//! trajectory. Raw binary dumps can be analysed too by splitting them into
//! fixed-size blocks first.

use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::conditioning::count_ones;
use crate::sample::Sample;
use crate::stats::{RunningStats, StatsError, Verdict, Z_THRESHOLD};

/// Minimum share of trajectory points within ±[`Z_THRESHOLD`] for a PASS.
pub const PASS_WITHIN_PERCENT: f64 = 90.0;

/// Any point beyond this |Z| forces REVIEW.
pub const PASS_MAX_ABS_Z: f64 = 3.0;

/// Cumulative statistics after one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryPoint {
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub ones_count: u64,
    pub cumulative_mean: f64,
    pub z_score: f64,
    pub p_value: f64,
}

/// Whole-capture summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub samples: u64,
    pub sample_size_bits: u64,
    /// Mean ones per sample.
    pub mean_ones: f64,
    /// `sample_size_bits / 2`.
    pub expected_ones: f64,
    pub mean_z: f64,
    pub max_abs_z: f64,
    /// Share of points with |Z| ≤ [`Z_THRESHOLD`], in percent.
    pub percent_within: f64,
    pub final_z: f64,
    pub final_p: f64,
    /// Verdict of the final cumulative Z.
    pub final_verdict: Verdict,
    /// PASS or REVIEW over the whole trajectory.
    pub assessment: Verdict,
}

/// Trajectory and summary for one capture.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub points: Vec<TrajectoryPoint>,
    pub summary: Option<SessionSummary>,
}

/// Replay `samples` in order, recording the statistics after each one.
pub fn trajectory(samples: &[Sample]) -> Result<(Vec<TrajectoryPoint>, RunningStats), StatsError> {
    let mut stats = RunningStats::new();
    let mut points = Vec::with_capacity(samples.len());
    for s in samples {
        stats.update(s)?;
        let snap = stats.snapshot();
        points.push(TrajectoryPoint {
            sequence_number: s.sequence_number,
            timestamp: s.timestamp,
            ones_count: s.ones_count,
            cumulative_mean: snap.cumulative_mean.unwrap_or_default(),
            z_score: snap.z_score.unwrap_or_default(),
            p_value: snap.p_value.unwrap_or(1.0),
        });
    }
    Ok((points, stats))
}

/// Summarize a trajectory. `None` for an empty capture.
pub fn summarize(points: &[TrajectoryPoint], stats: &RunningStats) -> Option<SessionSummary> {
    let last = points.last()?;
    let n = points.len() as f64;
    let samples = stats.sample_count();
    let sample_size_bits = stats.cumulative_bits() / samples.max(1);

    let mean_z = points.iter().map(|p| p.z_score).sum::<f64>() / n;
    let max_abs_z = points.iter().map(|p| p.z_score.abs()).fold(0.0, f64::max);
    let within = points.iter().filter(|p| p.z_score.abs() <= Z_THRESHOLD).count() as f64;
    let percent_within = 100.0 * within / n;

    let assessment = if percent_within > PASS_WITHIN_PERCENT && max_abs_z < PASS_MAX_ABS_Z {
        Verdict::Pass
    } else {
        Verdict::Review
    };

    Some(SessionSummary {
        samples,
        sample_size_bits,
        mean_ones: stats.cumulative_ones() as f64 / samples as f64,
        expected_ones: sample_size_bits as f64 / 2.0,
        mean_z,
        max_abs_z,
        percent_within,
        final_z: last.z_score,
        final_p: last.p_value,
        final_verdict: stats.verdict(),
        assessment,
    })
}

/// Trajectory plus summary.
pub fn analyze(samples: &[Sample]) -> Result<Analysis, StatsError> {
    let (points, stats) = trajectory(samples)?;
    let summary = summarize(&points, &stats);
    Ok(Analysis { points, summary })
}

/// Split a raw byte dump into `block_bits`-bit samples. A trailing partial
/// block is ignored. Timestamps are all `start`.
pub fn samples_from_raw(bytes: &[u8], block_bits: usize, source_id: &str, start: DateTime<Utc>) -> Vec<Sample> {
    if block_bits == 0 || block_bits % 8 != 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(block_bits / 8)
        .enumerate()
        .map(|(i, block)| Sample {
            sequence_number: i as u64 + 1,
            timestamp: start,
            ones_count: count_ones(block),
            bit_count: block_bits as u64,
            source_id: source_id.to_string(),
        })
        .collect()
}

/// Write the trajectory as CSV.
pub fn write_trajectory_csv(path: &Path, points: &[TrajectoryPoint]) -> io::Result<()> {
    let mut w = io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(w, "sequence_number,timestamp,ones_count,cumulative_mean,z_score,p_value")?;
    for p in points {
        writeln!(
            w,
            "{},{},{},{:.6},{:.6},{:.6}",
            p.sequence_number,
            p.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            p.ones_count,
            p.cumulative_mean,
            p.z_score,
            p.p_value
        )?;
    }
    w.flush()
}
