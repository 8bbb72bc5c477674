//! Capture files for collection sessions.
//!
//! Each session produces two files in the output directory, sharing a stem
//! that encodes the collection parameters:
//!
//! ```text
//! YYYYMMDDTHHMMSS_{source}_s{bits}_i{interval}[_f{fold}]
//! ```
//!
//! - `{stem}.csv`: one row per sample:
//!   `sequence_number,timestamp,ones_count,bit_count,source_id`
//! - `{stem}.session.json`: metadata written by [`SessionWriter::finish`]
//!
//! The timestamp in the stem is local time; the interval is whole seconds, or
//! `{n}ms` when the interval is not a whole number of seconds. The fold suffix
//! only appears for sources that fold.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sample::Sample;
use crate::source::SourceKind;
use crate::stats::{RunningStats, StatsSnapshot};

/// CSV header row.
pub const CSV_HEADER: &str = "sequence_number,timestamp,ones_count,bit_count,source_id";

const STEM_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

/// Machine information captured at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub cpu: String,
    pub cores: usize,
}

/// Detect machine information (best-effort).
pub fn detect_machine_info() -> MachineInfo {
    let os = match os_version() {
        Some(v) => format!("{} {v}", std::env::consts::OS),
        None => std::env::consts::OS.to_string(),
    };
    MachineInfo {
        os,
        arch: std::env::consts::ARCH.to_string(),
        cpu: detect_cpu().unwrap_or_else(|| "unknown".to_string()),
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

fn os_version() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release").ok().and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("PRETTY_NAME="))
                .map(|l| l.trim_start_matches("PRETTY_NAME=").trim_matches('"').to_string())
        })
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn detect_cpu() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/cpuinfo").ok().and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|v| v.trim().to_string())
        })
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sysctl")
            .arg("-n")
            .arg("machdep.cpu.brand_string")
            .output()
            .ok()?;
        let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if s.is_empty() { None } else { Some(s) }
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

// ---------------------------------------------------------------------------
// Capture names
// ---------------------------------------------------------------------------

/// Parameters recovered from a capture file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureName {
    /// Local start time.
    pub started: NaiveDateTime,
    pub source: String,
    pub sample_size_bits: usize,
    pub interval: Duration,
    pub fold: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureNameError {
    #[error("capture name {0:?} has no file stem")]
    Empty(String),
    #[error("capture name {name:?}: bad timestamp {value:?}")]
    Timestamp { name: String, value: String },
    #[error("capture name {name:?}: missing {field}")]
    Missing { name: String, field: &'static str },
    #[error("capture name {name:?}: bad {field} value {value:?}")]
    Value {
        name: String,
        field: &'static str,
        value: String,
    },
}

fn format_interval(interval: Duration) -> String {
    if interval.subsec_nanos() == 0 {
        interval.as_secs().to_string()
    } else {
        format!("{}ms", interval.as_millis())
    }
}

/// Build a capture stem from its parts.
pub fn format_capture_name(
    started: NaiveDateTime,
    source: &str,
    sample_size_bits: usize,
    interval: Duration,
    fold: Option<u8>,
) -> String {
    let mut stem = format!(
        "{}_{source}_s{sample_size_bits}_i{}",
        started.format(STEM_TIME_FORMAT),
        format_interval(interval)
    );
    if let Some(f) = fold {
        stem.push_str(&format!("_f{f}"));
    }
    stem
}

/// Recover parameters from a capture path or stem.
pub fn parse_capture_name(name: &str) -> Result<CaptureName, CaptureNameError> {
    let stem = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.split('.').next().unwrap_or(s))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CaptureNameError::Empty(name.to_string()))?;

    let mut parts = stem.split('_');
    let ts = parts.next().unwrap_or_default();
    let started = NaiveDateTime::parse_from_str(ts, STEM_TIME_FORMAT).map_err(|_| CaptureNameError::Timestamp {
        name: name.to_string(),
        value: ts.to_string(),
    })?;
    let source = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CaptureNameError::Missing {
            name: name.to_string(),
            field: "source",
        })?
        .to_string();

    let bad = |field: &'static str, value: &str| CaptureNameError::Value {
        name: name.to_string(),
        field,
        value: value.to_string(),
    };

    let mut bits = None;
    let mut interval = None;
    let mut fold = None;
    for part in parts {
        if let Some(v) = part.strip_prefix('s') {
            bits = Some(v.parse::<usize>().map_err(|_| bad("sample size", v))?);
        } else if let Some(v) = part.strip_prefix('i') {
            interval = Some(match v.strip_suffix("ms") {
                Some(ms) => Duration::from_millis(ms.parse().map_err(|_| bad("interval", v))?),
                None => Duration::from_secs(v.parse().map_err(|_| bad("interval", v))?),
            });
        } else if let Some(v) = part.strip_prefix('f') {
            fold = Some(v.parse::<u8>().map_err(|_| bad("fold", v))?);
        }
    }

    let missing = |field: &'static str| CaptureNameError::Missing {
        name: name.to_string(),
        field,
    };
    Ok(CaptureName {
        started,
        source,
        sample_size_bits: bits.ok_or_else(|| missing("sample size"))?,
        interval: interval.ok_or_else(|| missing("interval"))?,
        fold,
    })
}

// ---------------------------------------------------------------------------
// Session metadata
// ---------------------------------------------------------------------------

/// Metadata written next to the capture at the end of recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub source: String,
    pub sample_size_bits: usize,
    pub interval_ms: u64,
    pub fold: Option<u8>,
    pub target_duration_secs: u64,
    pub total_samples: u64,
    pub final_stats: StatsSnapshot,
    pub end_status: Option<String>,
    pub note: Option<String>,
    pub machine: MachineInfo,
    pub rngcollect_version: String,
}

// ---------------------------------------------------------------------------
// Session config
// ---------------------------------------------------------------------------

/// Where and how a session is recorded.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub source: SourceKind,
    pub sample_size_bits: usize,
    pub interval: Duration,
    pub fold: u8,
    pub duration: Duration,
    pub note: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data/raw"),
            source: SourceKind::Pseudo,
            sample_size_bits: 2048,
            interval: Duration::from_secs(1),
            fold: 0,
            duration: Duration::from_secs(60),
            note: None,
        }
    }
}

impl SessionConfig {
    /// Fold suffix value, present only for folding sources.
    fn fold_suffix(&self) -> Option<u8> {
        self.source.supports_fold().then_some(self.fold)
    }
}

// ---------------------------------------------------------------------------
// Session writer
// ---------------------------------------------------------------------------

/// How many `_N` suffixes are tried before giving up on a capture name.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Create `{stem}.csv` in `dir`, or `{stem}_2.csv`, `{stem}_3.csv`, ... when
/// an earlier capture with the same stem exists. The suffix is ignored by
/// [`parse_capture_name`].
fn create_capture(dir: &Path, stem: &str) -> io::Result<(PathBuf, File)> {
    for n in 1..=MAX_NAME_ATTEMPTS {
        let path = match n {
            1 => dir.join(format!("{stem}.csv")),
            n => dir.join(format!("{stem}_{n}.csv")),
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{MAX_NAME_ATTEMPTS} captures named {stem} already exist in {}", dir.display()),
    ))
}

/// Incremental CSV writer for one session.
pub struct SessionWriter {
    csv_path: PathBuf,
    csv_writer: BufWriter<File>,
    total_samples: u64,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    session_id: String,
    config: SessionConfig,
    machine: MachineInfo,
}

impl SessionWriter {
    /// Create the output directory and the capture CSV. Never overwrites; a
    /// name already taken gets a numeric suffix.
    pub fn new(config: SessionConfig) -> io::Result<Self> {
        let started_at = Utc::now();
        let stem = format_capture_name(
            started_at.with_timezone(&Local).naive_local(),
            config.source.code(),
            config.sample_size_bits,
            config.interval,
            config.fold_suffix(),
        );
        fs::create_dir_all(&config.output_dir)?;
        let (csv_path, file) = create_capture(&config.output_dir, &stem)?;
        let mut csv_writer = BufWriter::new(file);
        writeln!(csv_writer, "{CSV_HEADER}")?;
        csv_writer.flush()?;

        Ok(Self {
            csv_path,
            csv_writer,
            total_samples: 0,
            started_at,
            started_instant: Instant::now(),
            session_id: Uuid::new_v4().to_string(),
            config,
            machine: detect_machine_info(),
        })
    }

    /// Append one sample row.
    pub fn write_sample(&mut self, sample: &Sample) -> io::Result<()> {
        writeln!(
            self.csv_writer,
            "{},{},{},{},{}",
            sample.sequence_number,
            sample.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            sample.ones_count,
            sample.bit_count,
            sample.source_id
        )?;
        self.csv_writer.flush()?;
        self.total_samples += 1;
        Ok(())
    }

    /// Flush and write `{stem}.session.json`. Returns the CSV path.
    pub fn finish(mut self, stats: &RunningStats, end_status: Option<&str>) -> io::Result<PathBuf> {
        self.csv_writer.flush()?;

        let meta = SessionMeta {
            version: 1,
            id: self.session_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            source: self.config.source.code().to_string(),
            sample_size_bits: self.config.sample_size_bits,
            interval_ms: self.config.interval.as_millis() as u64,
            fold: self.config.fold_suffix(),
            target_duration_secs: self.config.duration.as_secs(),
            total_samples: self.total_samples,
            final_stats: stats.snapshot(),
            end_status: end_status.map(str::to_string),
            note: self.config.note.clone(),
            machine: self.machine,
            rngcollect_version: crate::VERSION.to_string(),
        };

        let json = serde_json::to_string_pretty(&meta).map_err(io::Error::other)?;
        fs::write(meta_path(&self.csv_path), json)?;
        Ok(self.csv_path)
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

/// Metadata path for a capture CSV.
pub fn meta_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension("session.json")
}

// ---------------------------------------------------------------------------
// Reading captures
// ---------------------------------------------------------------------------

fn invalid(line_no: usize, msg: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("line {line_no}: {msg}"))
}

fn parse_row(line_no: usize, line: &str) -> io::Result<Sample> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return Err(invalid(line_no, format!("expected 5 fields, got {}", fields.len())));
    }
    let num = |i: usize| fields[i].parse::<u64>().map_err(|e| invalid(line_no, e));
    Ok(Sample {
        sequence_number: num(0)?,
        timestamp: DateTime::parse_from_rfc3339(fields[1])
            .map_err(|e| invalid(line_no, e))?
            .with_timezone(&Utc),
        ones_count: num(2)?,
        bit_count: num(3)?,
        source_id: fields[4].to_string(),
    })
}

/// Load every sample from a capture CSV.
pub fn read_samples(path: &Path) -> io::Result<Vec<Sample>> {
    let reader = BufReader::new(File::open(path)?);
    let mut samples = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if i == 0 {
            if line.trim() != CSV_HEADER {
                return Err(invalid(1, "unexpected header"));
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        samples.push(parse_row(i + 1, &line)?);
    }
    Ok(samples)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
