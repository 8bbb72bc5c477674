//! `rngcollect generate`: direct reads from one source.

use std::path::PathBuf;

use rngcollect_core::{EntropySource, SourceError, release_or_warn};

use super::{fail, make_descriptor};

pub enum Mode {
    Bytes(usize),
    Bits(usize),
    Int { min: i64, max: i64, count: usize },
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn draw(src: &mut dyn EntropySource, mode: &Mode) -> Result<Vec<String>, SourceError> {
    Ok(match *mode {
        Mode::Bytes(n) => vec![hex(&src.generate_bytes(n)?)],
        Mode::Bits(n) => vec![hex(&src.generate_exact_bits(n)?)],
        Mode::Int { min, max, count } => (0..count)
            .map(|_| src.random_int(min, max).map(|v| v.to_string()))
            .collect::<Result<_, _>>()?,
    })
}

pub fn run(source: &str, fold: u8, device: Option<PathBuf>, mode: Mode) {
    let descriptor = make_descriptor(source, fold, device).unwrap_or_else(|e| fail(e));
    let mut src = descriptor.build().unwrap_or_else(|e| fail(e));
    if !src.is_available() {
        let reason = src.unavailable_reason();
        release_or_warn(src.as_mut());
        match reason {
            Some(r) => fail(format!("source '{}' is not available: {r}", descriptor.id())),
            None => fail(format!("source '{}' is not available", descriptor.id())),
        }
    }

    let result = draw(src.as_mut(), &mode);
    release_or_warn(src.as_mut());
    match result {
        Ok(lines) => lines.iter().for_each(|l| println!("{l}")),
        Err(e) => fail(e),
    }
}
