use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(target_os = "linux")]
use nix::ioctl_read;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

#[cfg(target_os = "linux")]
ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// An opaque, stable handle for a block device.
///
/// This is the only value used to key the engine's exclusivity lock table
/// and to open the device for raw access. On Linux it wraps the device node
/// path (e.g. `/dev/sdb`); callers must treat it as opaque and never use a
/// human-readable label in its place.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(raw: impl Into<String>) -> Self {
        DeviceId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A removable block device discovered on the system.
///
/// Descriptors are constructed fresh on every enumeration and are never
/// persisted. They go stale the moment the physical device changes, which
/// is why the write engine re-probes identity and capacity immediately
/// before the first byte is written.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
    /// Stable handle used for locking and raw access.
    pub id: DeviceId,
    /// Short human-readable label (e.g. the kernel device name). UI only.
    pub display_label: String,
    /// Hardware model string, if the platform exposes one. UI only.
    pub model: String,
    /// Total device capacity in bytes.
    pub capacity_bytes: u64,
    /// Whether the platform reports the device as removable. The catalog
    /// only ever returns removable devices; the flag is kept so callers
    /// can re-check the safety policy themselves.
    pub removable: bool,
}

impl DeviceDescriptor {
    /// Capacity in gigabytes, for display.
    pub fn capacity_gb(&self) -> f64 {
        self.capacity_bytes as f64 / (1000.0 * 1000.0 * 1000.0)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {:<24} {:.1} GB",
            self.display_label,
            self.model,
            self.capacity_gb()
        )
    }
}

/// Raw positioned I/O against a block device.
///
/// This is the engine's only view of the platform's raw-access primitive.
/// Production code uses [`FileTarget`]; tests substitute fixtures that
/// inject short writes and device errors.
pub trait BlockTarget: Send {
    /// Total capacity of the target in bytes.
    fn capacity_bytes(&mut self) -> io::Result<u64>;

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` starting at `offset`, returning the number of bytes
    /// actually written. A short count is not an error at this layer; the
    /// engine treats it as one.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flushes all written data to stable storage.
    fn flush(&mut self) -> io::Result<()>;
}

/// A [`BlockTarget`] backed by an open file handle.
///
/// Works for both real block devices and regular files, which is what lets
/// the whole pipeline run against plain image files in tests.
pub struct FileTarget {
    file: File,
}

impl FileTarget {
    /// Opens `path` for read/write access without any exclusivity claim.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileTarget { file })
    }

    /// Opens a block device for exclusive read/write access.
    ///
    /// On Linux, `O_EXCL` on a block device makes the open fail with `EBUSY`
    /// while the device (or any partition on it) is mounted or otherwise
    /// claimed, which is exactly the "open for exclusive access" primitive
    /// the engine needs.
    #[cfg(unix)]
    pub fn open_exclusive(path: &Path) -> io::Result<Self> {
        use crate::os_options::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)?;
        Ok(FileTarget { file })
    }

    #[cfg(not(unix))]
    pub fn open_exclusive(path: &Path) -> io::Result<Self> {
        // On Windows exclusive access needs FSCTL_LOCK_VOLUME on every
        // mounted volume of the disk, via DeviceIoControl. Until that port
        // lands, a plain open keeps the API shape.
        Self::open(path)
    }
}

impl BlockTarget for FileTarget {
    fn capacity_bytes(&mut self) -> io::Result<u64> {
        let meta = self.file.metadata()?;

        // Regular files report their length; block devices report zero and
        // need the BLKGETSIZE64 ioctl instead.
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::FileTypeExt;
            if meta.file_type().is_block_device() {
                let mut size: u64 = 0;
                unsafe {
                    blkgetsize64(self.file.as_raw_fd(), &mut size)
                        .map_err(io::Error::other)?;
                }
                return Ok(size);
            }
        }

        Ok(meta.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn file_target_round_trips_positioned_io() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 4096]).unwrap();

        let mut target = FileTarget::open(tmp.path()).unwrap();
        assert_eq!(target.capacity_bytes().unwrap(), 4096);

        let n = target.write_at(1024, b"ignis").unwrap();
        assert_eq!(n, 5);
        target.flush().unwrap();

        let mut back = [0u8; 5];
        target.read_at(1024, &mut back).unwrap();
        assert_eq!(&back, b"ignis");
    }

    #[test]
    fn read_past_end_fails() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut target = FileTarget::open(tmp.path()).unwrap();
        let mut buf = [0u8; 16];
        assert!(target.read_at(0, &mut buf).is_err());
    }
}
