//! Drains a running collector into a capture file.

use std::io;
use std::path::PathBuf;

use crossbeam_channel::Receiver;
use log::warn;

use crate::sample::Sample;
use crate::scheduler::{Collector, SessionSnapshot};
use crate::session::SessionWriter;

/// Write every sample from `samples` until the session ends, then finish the
/// capture. `samples` must come from [`Collector::subscribe`].
///
/// On a write error the session is stopped and the error returned.
pub fn record<F>(
    collector: &Collector,
    samples: Receiver<Sample>,
    mut writer: SessionWriter,
    mut progress: F,
) -> io::Result<PathBuf>
where
    F: FnMut(&Sample, &SessionSnapshot),
{
    for sample in samples.iter() {
        if let Err(e) = writer.write_sample(&sample) {
            warn!("capture write failed, stopping session: {e}");
            let _ = collector.stop();
            return Err(e);
        }
        progress(&sample, &collector.snapshot());
    }

    let snapshot = collector.snapshot();
    writer.finish(&collector.stats(), Some(&snapshot.status.to_string()))
}
