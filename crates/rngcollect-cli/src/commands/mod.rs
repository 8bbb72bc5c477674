pub mod analyze;
pub mod generate;
pub mod record;
pub mod scan;
pub mod server;

use std::path::PathBuf;
use std::time::Duration;

use rngcollect_core::{SourceDescriptor, SourceKind, SourceParams};

/// Print an error and exit non-zero.
pub fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

/// Resolve a source code or long name.
pub fn parse_source(s: &str) -> Result<SourceKind, String> {
    SourceKind::from_code(s).ok_or_else(|| {
        let codes: Vec<&str> = SourceKind::ALL.iter().map(|k| k.code()).collect();
        format!("unknown source '{s}' (expected one of: {})", codes.join(", "))
    })
}

/// Source descriptor from command-line flags.
pub fn make_descriptor(source: &str, fold: u8, device: Option<PathBuf>) -> Result<SourceDescriptor, String> {
    let kind = parse_source(source)?;
    let params = SourceParams {
        fold_level: fold,
        device_path: device,
    };
    params.validate(kind).map_err(|e| e.to_string())?;
    Ok(SourceDescriptor::new(kind, params))
}

/// Parse a duration string like "5m", "30s", "1h", "100ms". Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    let (numeric, multiplier) = if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1000)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000)
    } else {
        (s, 1000)
    };

    let value: u64 = numeric.trim().parse().map_err(|_| format!("invalid duration: {s}"))?;
    value
        .checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration too large: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_duration tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("").is_err());
    }

    // -----------------------------------------------------------------------
    // source parsing tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_source_codes_and_names() {
        assert_eq!(parse_source("bitb").unwrap(), SourceKind::BitBabbler);
        assert_eq!(parse_source("TrueRNG").unwrap(), SourceKind::TrueRng);
        assert_eq!(parse_source("intel").unwrap(), SourceKind::IntelSeed);
        assert_eq!(parse_source("pseudo").unwrap(), SourceKind::Pseudo);
        let err = parse_source("quantum").unwrap_err();
        assert!(err.contains("bitb, trng, intel, pseudo"));
    }

    #[test]
    fn test_make_descriptor_validates_fold() {
        assert!(make_descriptor("bitb", 4, None).is_ok());
        assert!(make_descriptor("bitb", 5, None).is_err());
        assert!(make_descriptor("pseudo", 1, None).is_err());
        let d = make_descriptor("trng", 0, Some("/dev/ttyACM0".into())).unwrap();
        assert_eq!(d.params.device_path.as_deref(), Some(std::path::Path::new("/dev/ttyACM0")));
    }
}
