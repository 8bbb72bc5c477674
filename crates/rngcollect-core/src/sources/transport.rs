//! Raw byte transports underneath the hardware sources.
//!
//! Hardware sources speak to a [`RawTransport`] rather than a file directly so
//! their framing, chunking and error mapping can be exercised with in-memory
//! fakes.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// A byte pipe to a device.
pub trait RawTransport: Send {
    /// Cheap presence check. Must not read from the device.
    fn is_present(&self) -> bool;

    /// Read up to `n` bytes. A short result means the device stopped
    /// delivering (timeout or end of stream).
    fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>>;

    /// Close any open handle. Calling it on a closed transport is a no-op.
    fn close(&mut self) -> io::Result<()>;
}

/// Fill up to `n` bytes from `reader`, stopping early at a zero-length read.
pub fn read_up_to<R: Read>(reader: &mut R, n: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(k) => filled += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Character device
// ---------------------------------------------------------------------------

/// A character device opened read-only on first use.
#[derive(Debug)]
pub struct DeviceFileTransport {
    path: PathBuf,
    file: Option<File>,
}

impl DeviceFileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawTransport for DeviceFileTransport {
    fn is_present(&self) -> bool {
        self.path.exists()
    }

    fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path)?);
        }
        match self.file.as_mut() {
            Some(file) => read_up_to(file, n),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "device not open")),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_up_to_stops_at_eof() {
        let mut data: &[u8] = &[1, 2, 3];
        assert_eq!(read_up_to(&mut data, 8).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn device_file_reads_lazily_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[9u8; 16])
            .unwrap();

        let mut t = DeviceFileTransport::new(&path);
        assert!(t.is_present());
        assert_eq!(t.read_raw(10).unwrap().len(), 10);
        assert_eq!(t.read_raw(10).unwrap().len(), 6);
        t.close().unwrap();
        t.close().unwrap();
        // Reopened from the start.
        assert_eq!(t.read_raw(4).unwrap(), vec![9; 4]);
    }

    #[test]
    fn missing_device_is_not_present() {
        let t = DeviceFileTransport::new("/nonexistent/rngcollect/dev");
        assert!(!t.is_present());
    }
}
