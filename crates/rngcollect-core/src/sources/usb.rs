//! BitBabbler USB source with XOR-fold whitening.
//!
//! Raw bytes come from a character device exposed by the BitBabbler driver
//! bridge (`/dev/bitbabbler0` unless configured). Reads are split so that no
//! single raw transfer exceeds [`MAX_RAW_TRANSFER`] bytes, and each transfer is
//! folded independently. Group boundaries always fall on transfer boundaries
//! because the per-transfer raw size is a multiple of `2^fold`.

use std::path::{Path, PathBuf};

use crate::conditioning::{fold_input_len, xor_fold};
use crate::source::{EntropySource, SourceError, SourceInfo, SourceParams, Transport};
use crate::sources::transport::{DeviceFileTransport, RawTransport};

/// Largest raw read issued to the device in one transfer.
pub const MAX_RAW_TRANSFER: usize = 65536;

/// USB vendor id of the FTDI bridge used by BitBabbler.
pub const BITBABBLER_VID: &str = "0403";
/// USB product id of the BitBabbler.
pub const BITBABBLER_PID: &str = "7840";

/// Default device node for the raw stream.
pub const DEFAULT_DEVICE: &str = "/dev/bitbabbler0";

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

static BITBABBLER_INFO: SourceInfo = SourceInfo {
    id: "bitb",
    name: "BitBabbler",
    description: "BitBabbler USB hardware RNG with XOR-fold whitening",
    transport: Transport::Usb,
    supports_fold: true,
};

/// BitBabbler source over any [`RawTransport`].
pub struct BitBabblerSource<T: RawTransport = DeviceFileTransport> {
    transport: T,
    fold: u8,
    /// Device node to name in diagnostics; `None` for custom transports.
    device: Option<PathBuf>,
}

impl BitBabblerSource<DeviceFileTransport> {
    /// Build from parameters. Fails when the fold level is out of range.
    pub fn new(params: &SourceParams) -> Result<Self, SourceError> {
        params.validate(crate::source::SourceKind::BitBabbler)?;
        let path = params
            .device_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));
        Ok(Self {
            transport: DeviceFileTransport::new(path.clone()),
            fold: params.fold_level,
            device: Some(path),
        })
    }
}

impl<T: RawTransport> BitBabblerSource<T> {
    /// Build over an arbitrary transport.
    pub fn with_transport(transport: T, fold: u8) -> Result<Self, SourceError> {
        let params = SourceParams {
            fold_level: fold,
            device_path: None,
        };
        params.validate(crate::source::SourceKind::BitBabbler)?;
        Ok(Self {
            transport,
            fold,
            device: None,
        })
    }

    pub fn fold_level(&self) -> u8 {
        self.fold
    }

    /// Output bytes produced per raw transfer.
    fn output_per_transfer(&self) -> usize {
        MAX_RAW_TRANSFER >> self.fold
    }
}

impl<T: RawTransport> EntropySource for BitBabblerSource<T> {
    fn info(&self) -> &SourceInfo {
        &BITBABBLER_INFO
    }

    /// Only the node the reads go through counts. A device that is merely
    /// enumerated in sysfs shows up in [`unavailable_reason`](Self::unavailable_reason).
    fn is_available(&self) -> bool {
        self.transport.is_present()
    }

    fn unavailable_reason(&self) -> Option<String> {
        let device = self.device.as_deref()?;
        Some(missing_node_reason(device, Path::new(SYSFS_USB_DEVICES)))
    }

    fn collect(&mut self, n_bytes: usize) -> Result<Vec<u8>, SourceError> {
        let id = BITBABBLER_INFO.id;
        let mut out = Vec::with_capacity(n_bytes);
        let per_transfer = self.output_per_transfer();

        while out.len() < n_bytes {
            let want = (n_bytes - out.len()).min(per_transfer);
            let raw_len = fold_input_len(want, self.fold);
            let raw = self
                .transport
                .read_raw(raw_len)
                .map_err(|e| SourceError::device(id, "read", e.to_string()))?;
            if raw.len() != raw_len {
                return Err(SourceError::device(
                    id,
                    "read",
                    format!("short transfer: wanted {raw_len} raw bytes, got {}", raw.len()),
                ));
            }
            out.extend(xor_fold(&raw, self.fold));
        }
        Ok(out)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        self.transport
            .close()
            .map_err(|e| SourceError::ResourceRelease {
                source_id: BITBABBLER_INFO.id.to_string(),
                operation: "release",
                cause: e.to_string(),
            })
    }
}

/// Explain a missing device node, noting when the USB device itself is enumerated.
pub fn missing_node_reason(device: &Path, sysfs_root: &Path) -> String {
    if usb_device_present(sysfs_root) {
        format!(
            "BitBabbler {BITBABBLER_VID}:{BITBABBLER_PID} is plugged in but {} does not exist",
            device.display()
        )
    } else {
        format!("{} does not exist", device.display())
    }
}

/// Whether a device with the BitBabbler VID:PID is enumerated under `sysfs_root`.
pub fn usb_device_present(sysfs_root: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(sysfs_root) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let dir = entry.path();
        let read = |name: &str| {
            std::fs::read_to_string(dir.join(name))
                .map(|s| s.trim().to_ascii_lowercase())
                .unwrap_or_default()
        };
        read("idVendor") == BITBABBLER_VID && read("idProduct") == BITBABBLER_PID
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Serves a repeating byte pattern and records transfer sizes.
    struct FakeUsb {
        pattern: Vec<u8>,
        transfers: Arc<Mutex<Vec<usize>>>,
        closes: Arc<Mutex<u32>>,
        truncate: bool,
        present: bool,
    }

    impl FakeUsb {
        fn new(pattern: Vec<u8>) -> Self {
            Self {
                pattern,
                transfers: Arc::default(),
                closes: Arc::default(),
                truncate: false,
                present: true,
            }
        }
    }

    impl RawTransport for FakeUsb {
        fn is_present(&self) -> bool {
            self.present
        }
        fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
            self.transfers.lock().unwrap().push(n);
            let n = if self.truncate { n / 2 } else { n };
            Ok((0..n).map(|i| self.pattern[i % self.pattern.len()]).collect())
        }
        fn close(&mut self) -> io::Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn fold_level_one_pairs_raw_bytes() {
        let mut src = BitBabblerSource::with_transport(FakeUsb::new(vec![0x0F, 0xF0, 0x33, 0x30]), 1).unwrap();
        assert_eq!(src.generate_bytes(4).unwrap(), vec![0xFF, 0x03, 0xFF, 0x03]);
    }

    #[test]
    fn exact_bits_for_every_fold_level() {
        for fold in 0..=4 {
            let mut src = BitBabblerSource::with_transport(FakeUsb::new(vec![1, 2, 3]), fold).unwrap();
            for n in [8usize, 64, 2048, 8 * 5000] {
                assert_eq!(src.generate_exact_bits(n).unwrap().len(), n / 8);
            }
        }
    }

    #[test]
    fn transfers_never_exceed_limit() {
        let fake = FakeUsb::new(vec![0xAB]);
        let transfers = Arc::clone(&fake.transfers);
        let mut src = BitBabblerSource::with_transport(fake, 2).unwrap();
        // 40000 output bytes at fold 2 = 160000 raw bytes.
        assert_eq!(src.generate_bytes(40_000).unwrap().len(), 40_000);
        let sizes = transfers.lock().unwrap().clone();
        assert!(sizes.iter().all(|&s| s <= MAX_RAW_TRANSFER));
        assert_eq!(sizes.iter().sum::<usize>(), 160_000);
        assert!(sizes.iter().all(|&s| s % 4 == 0));
    }

    #[test]
    fn short_transfer_is_permanent_error() {
        let mut fake = FakeUsb::new(vec![0]);
        fake.truncate = true;
        let mut src = BitBabblerSource::with_transport(fake, 0).unwrap();
        let err = src.generate_bytes(16).unwrap_err();
        assert!(matches!(err, SourceError::DeviceError { transient: false, .. }));
    }

    #[test]
    fn invalid_fold_level_rejected() {
        assert!(matches!(
            BitBabblerSource::with_transport(FakeUsb::new(vec![0]), 5),
            Err(SourceError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn release_closes_transport_each_call() {
        let fake = FakeUsb::new(vec![0]);
        let closes = Arc::clone(&fake.closes);
        let mut src = BitBabblerSource::with_transport(fake, 0).unwrap();
        src.release().unwrap();
        src.release().unwrap();
        assert_eq!(*closes.lock().unwrap(), 2);
    }

    #[test]
    fn sysfs_scan_matches_vid_pid() {
        let root = tempfile::tempdir().unwrap();
        let other = root.path().join("1-1");
        std::fs::create_dir(&other).unwrap();
        std::fs::write(other.join("idVendor"), "1d6b\n").unwrap();
        std::fs::write(other.join("idProduct"), "0002\n").unwrap();
        assert!(!usb_device_present(root.path()));

        let bb = root.path().join("1-2");
        std::fs::create_dir(&bb).unwrap();
        std::fs::write(bb.join("idVendor"), "0403\n").unwrap();
        std::fs::write(bb.join("idProduct"), "7840\n").unwrap();
        assert!(usb_device_present(root.path()));
    }

    #[test]
    fn missing_explicit_path_is_unavailable() {
        let params = SourceParams {
            fold_level: 0,
            device_path: Some("/nonexistent/bitbabbler".into()),
        };
        let src = BitBabblerSource::new(&params).unwrap();
        assert!(!src.is_available());
    }

    #[test]
    fn availability_follows_transport_only() {
        let mut usb = FakeUsb::new(vec![0]);
        usb.present = false;
        let src = BitBabblerSource::with_transport(usb, 0).unwrap();
        assert!(!src.is_available());
        assert_eq!(src.unavailable_reason(), None);

        let node = tempfile::NamedTempFile::new().unwrap();
        let params = SourceParams {
            fold_level: 0,
            device_path: Some(node.path().to_path_buf()),
        };
        assert!(BitBabblerSource::new(&params).unwrap().is_available());
    }

    #[test]
    fn enumerated_device_without_node_is_named_in_reason() {
        let root = tempfile::tempdir().unwrap();
        let node = Path::new("/nonexistent/bitbabbler0");
        assert_eq!(missing_node_reason(node, root.path()), "/nonexistent/bitbabbler0 does not exist");

        let bb = root.path().join("1-2");
        std::fs::create_dir(&bb).unwrap();
        std::fs::write(bb.join("idVendor"), "0403\n").unwrap();
        std::fs::write(bb.join("idProduct"), "7840\n").unwrap();
        let reason = missing_node_reason(node, root.path());
        assert!(reason.contains("0403:7840 is plugged in"));
        assert!(reason.contains("/nonexistent/bitbabbler0"));
    }
}
