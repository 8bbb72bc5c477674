use rngcollect_core::sources::SourceDescriptor;
use rngcollect_core::{SourceKind, SourceParams, release_or_warn};

pub fn run() {
    println!(
        "Platform: {} {} (rngcollect {})",
        std::env::consts::OS,
        std::env::consts::ARCH,
        rngcollect_core::VERSION
    );
    println!();

    let mut found = 0;
    for &kind in SourceKind::ALL.iter() {
        let descriptor = SourceDescriptor::new(kind, SourceParams::default());
        let (available, info) = match descriptor.build() {
            Ok(mut src) => {
                let available = src.is_available();
                let info = src.info().clone();
                release_or_warn(src.as_mut());
                (available, Some(info))
            }
            Err(e) => {
                log::warn!("{e}");
                (false, None)
            }
        };
        if available {
            found += 1;
        }
        let mark = if available { "\u{2705}" } else { "\u{274C}" };
        match info {
            Some(info) => println!(
                "  {mark} {:<7} {:<14} {:<9} {}",
                kind.code(),
                info.name,
                info.transport,
                info.description
            ),
            None => println!("  {mark} {:<7}", kind.code()),
        }
    }

    println!();
    println!("{found}/{} source(s) available", SourceKind::ALL.len());
}
