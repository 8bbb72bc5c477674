//! TrueRNG serial source.
//!
//! The device enumerates as a USB CDC serial port. It is located through the
//! stable `/dev/serial/by-id` links, opened lazily on the first read in raw
//! mode with DTR asserted (the device only streams while DTR is high), and
//! the stale input buffer is flushed before the first byte is consumed.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source::{EntropySource, SourceError, SourceInfo, SourceParams, Transport};
use crate::sources::transport::{RawTransport, read_up_to};

/// Directory of stable serial device links.
pub const SERIAL_BY_ID: &str = "/dev/serial/by-id";

/// Per-read inactivity timeout on the port.
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(10);

static TRUERNG_INFO: SourceInfo = SourceInfo {
    id: "trng",
    name: "TrueRNG",
    description: "TrueRNG USB serial hardware RNG",
    transport: Transport::Serial,
    supports_fold: false,
};

/// First entry under `by_id` whose name contains `TrueRNG`.
pub fn discover_port(by_id: &Path) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = std::fs::read_dir(by_id)
        .ok()?
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .contains("truerng")
        })
        .map(|e| e.path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

// ---------------------------------------------------------------------------
// TTY transport
// ---------------------------------------------------------------------------

/// A serial port configured for raw binary reads.
#[derive(Debug)]
pub struct TtyTransport {
    path: Option<PathBuf>,
    timeout: Duration,
    file: Option<File>,
}

impl TtyTransport {
    pub fn new(path: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            path,
            timeout,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let path = self
                .path
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no TrueRNG port found"))?;
            let file = open_port(path)?;
            configure_raw(&file, self.timeout)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port not open"))
    }
}

impl RawTransport for TtyTransport {
    fn is_present(&self) -> bool {
        self.path.as_ref().is_some_and(|p| p.exists())
    }

    fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let file = self.open()?;
        read_up_to(file, n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

#[cfg(unix)]
fn open_port(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
}

#[cfg(not(unix))]
fn open_port(path: &Path) -> io::Result<File> {
    std::fs::OpenOptions::new().read(true).write(true).open(path)
}

/// Raw mode, inter-byte timeout, DTR high, input flushed.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn configure_raw(file: &File, timeout: Duration) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let deciseconds = (timeout.as_millis() / 100).clamp(1, 255) as libc::cc_t;

    // SAFETY: fd is a valid open descriptor owned by `file` for the duration of
    // these calls; termios is fully initialised by tcgetattr before use.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = deciseconds;
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }

        let dtr: libc::c_int = libc::TIOCM_DTR;
        if libc::ioctl(fd, libc::TIOCMBIS, &dtr as *const libc::c_int) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcflush(fd, libc::TCIFLUSH) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn configure_raw(_file: &File, _timeout: Duration) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// TrueRNG source over any [`RawTransport`].
pub struct TrueRngSource<T: RawTransport = TtyTransport> {
    transport: T,
}

impl TrueRngSource<TtyTransport> {
    /// Use the configured port, or discover one under [`SERIAL_BY_ID`].
    pub fn new(params: &SourceParams) -> Result<Self, SourceError> {
        params.validate(crate::source::SourceKind::TrueRng)?;
        let path = params
            .device_path
            .clone()
            .or_else(|| discover_port(Path::new(SERIAL_BY_ID)));
        Ok(Self {
            transport: TtyTransport::new(path, SERIAL_TIMEOUT),
        })
    }
}

impl<T: RawTransport> TrueRngSource<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: RawTransport> EntropySource for TrueRngSource<T> {
    fn info(&self) -> &SourceInfo {
        &TRUERNG_INFO
    }

    fn is_available(&self) -> bool {
        self.transport.is_present()
    }

    fn collect(&mut self, n_bytes: usize) -> Result<Vec<u8>, SourceError> {
        let id = TRUERNG_INFO.id;
        let bytes = self
            .transport
            .read_raw(n_bytes)
            .map_err(|e| SourceError::device(id, "read", e.to_string()))?;
        if bytes.len() != n_bytes {
            return Err(SourceError::device(
                id,
                "read",
                format!(
                    "serial framing: expected {n_bytes} bytes within timeout, got {}",
                    bytes.len()
                ),
            ));
        }
        Ok(bytes)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        self.transport
            .close()
            .map_err(|e| SourceError::ResourceRelease {
                source_id: TRUERNG_INFO.id.to_string(),
                operation: "release",
                cause: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTty {
        available: usize,
        open: bool,
    }

    impl RawTransport for FakeTty {
        fn is_present(&self) -> bool {
            true
        }
        fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
            self.open = true;
            let k = n.min(self.available);
            self.available -= k;
            Ok(vec![0x5A; k])
        }
        fn close(&mut self) -> io::Result<()> {
            self.open = false;
            Ok(())
        }
    }

    #[test]
    fn exact_bits_from_fake_port() {
        let mut src = TrueRngSource::with_transport(FakeTty {
            available: usize::MAX,
            open: false,
        });
        for n in (8..=1024).step_by(8) {
            assert_eq!(src.generate_exact_bits(n).unwrap().len(), n / 8);
        }
    }

    #[test]
    fn short_read_escalates_immediately() {
        let mut src = TrueRngSource::with_transport(FakeTty {
            available: 3,
            open: false,
        });
        let err = src.generate_bytes(8).unwrap_err();
        assert!(matches!(err, SourceError::DeviceError { transient: false, .. }));
        assert_eq!(src.retry_policy().max_attempts, 1);
    }

    #[test]
    fn release_closes_port() {
        let mut src = TrueRngSource::with_transport(FakeTty {
            available: 64,
            open: false,
        });
        src.generate_bytes(4).unwrap();
        assert!(src.transport.open);
        src.release().unwrap();
        assert!(!src.transport.open);
        src.release().unwrap();
    }

    #[test]
    fn discovers_truerng_link() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("usb-FTDI_Other-if00"), "").unwrap();
        assert_eq!(discover_port(dir.path()), None);
        std::fs::write(dir.path().join("usb-ubld.it_TrueRNG_001-if00"), "").unwrap();
        let found = discover_port(dir.path()).unwrap();
        assert!(found.to_string_lossy().contains("TrueRNG"));
    }

    #[test]
    fn no_port_means_unavailable() {
        let src = TrueRngSource::with_transport(TtyTransport::new(None, SERIAL_TIMEOUT));
        assert!(!src.is_available());
    }

    #[test]
    #[ignore = "requires a TrueRNG device"]
    fn reads_from_real_device() {
        let mut src = TrueRngSource::new(&SourceParams::default()).unwrap();
        assert!(src.is_available());
        assert_eq!(src.generate_exact_bits(2048).unwrap().len(), 256);
        src.release().unwrap();
    }
}
