//! Shared fixtures for the engine's test suite.
//!
//! `FixtureCatalog` is a [`DeviceCatalog`] over plain files in a temp
//! directory, with knobs to simulate the failure modes a real device layer
//! produces: unplugged or swapped devices, write errors at a chosen offset,
//! slow media, and silent corruption between write and verify.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::catalog::DeviceCatalog;
use crate::device::{BlockTarget, DeviceDescriptor, DeviceId};
use crate::error::EngineError;

#[derive(Clone)]
struct FixtureEntry {
    path: PathBuf,
    descriptor: DeviceDescriptor,
    present: bool,
    fail_write_at: Option<u64>,
    write_delay: Option<Duration>,
    corrupt_on_flush: Option<u64>,
}

pub(crate) struct FixtureCatalog {
    entries: Mutex<HashMap<String, FixtureEntry>>,
}

impl FixtureCatalog {
    pub fn new() -> (Arc<FixtureCatalog>, TempDir) {
        let dir = tempfile::tempdir().expect("create fixture dir");
        (
            Arc::new(FixtureCatalog {
                entries: Mutex::new(HashMap::new()),
            }),
            dir,
        )
    }

    /// Registers a file-backed device of the given capacity and returns its
    /// descriptor, the way an enumeration call would.
    pub fn add_device(&self, dir: &Path, name: &str, capacity: u64) -> DeviceDescriptor {
        let path = dir.join(name);
        let file = File::create(&path).expect("create backing file");
        file.set_len(capacity).expect("size backing file");

        let id = DeviceId::new(path.to_string_lossy().into_owned());
        let descriptor = DeviceDescriptor {
            id: id.clone(),
            display_label: name.to_string(),
            model: "Fixture Flash".to_string(),
            capacity_bytes: capacity,
            removable: true,
        };
        self.entries.lock().expect("fixture lock").insert(
            id.as_str().to_string(),
            FixtureEntry {
                path,
                descriptor: descriptor.clone(),
                present: true,
                fail_write_at: None,
                write_delay: None,
                corrupt_on_flush: None,
            },
        );
        descriptor
    }

    pub fn backing_file(&self, id: &DeviceId) -> PathBuf {
        self.with_entry(id, |e| e.path.clone())
    }

    /// Simulates swapping the stick for a different-sized one.
    pub fn set_capacity(&self, id: &DeviceId, capacity: u64) {
        self.with_entry(id, |e| e.descriptor.capacity_bytes = capacity);
    }

    /// Simulates removing the device entirely.
    pub fn unplug(&self, id: &DeviceId) {
        self.with_entry(id, |e| e.present = false);
    }

    /// Arms a one-shot write failure covering the given absolute offset.
    /// Consumed by the next `open_target`.
    pub fn fail_next_write_at(&self, id: &DeviceId, offset: u64) {
        self.with_entry(id, |e| e.fail_write_at = Some(offset));
    }

    /// Delays every write, so sessions stay observably in `Writing`.
    pub fn set_write_delay(&self, id: &DeviceId, delay: Duration) {
        self.with_entry(id, |e| e.write_delay = Some(delay));
    }

    /// Arms a one-shot byte flip applied at flush time, after the write
    /// stage accepted the data.
    pub fn corrupt_on_flush(&self, id: &DeviceId, offset: u64) {
        self.with_entry(id, |e| e.corrupt_on_flush = Some(offset));
    }

    fn with_entry<T>(&self, id: &DeviceId, f: impl FnOnce(&mut FixtureEntry) -> T) -> T {
        let mut entries = self.entries.lock().expect("fixture lock");
        f(entries.get_mut(id.as_str()).expect("unknown fixture device"))
    }
}

impl DeviceCatalog for FixtureCatalog {
    fn list_removable_devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        let entries = self.entries.lock().expect("fixture lock");
        Ok(entries
            .values()
            .filter(|e| e.present)
            .map(|e| e.descriptor.clone())
            .collect())
    }

    fn probe(&self, id: &DeviceId) -> Result<Option<DeviceDescriptor>, EngineError> {
        let entries = self.entries.lock().expect("fixture lock");
        Ok(entries
            .get(id.as_str())
            .filter(|e| e.present)
            .map(|e| e.descriptor.clone()))
    }

    fn open_target(&self, id: &DeviceId) -> Result<Box<dyn BlockTarget>, EngineError> {
        let mut entries = self.entries.lock().expect("fixture lock");
        let entry = entries
            .get_mut(id.as_str())
            .filter(|e| e.present)
            .ok_or_else(|| EngineError::Io {
                offset: 0,
                message: format!("no such device: {id}"),
            })?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&entry.path)
            .map_err(|e| EngineError::Io {
                offset: 0,
                message: e.to_string(),
            })?;

        Ok(Box::new(FixtureTarget {
            file,
            capacity: entry.descriptor.capacity_bytes,
            fail_write_at: entry.fail_write_at.take(),
            write_delay: entry.write_delay,
            corrupt_on_flush: entry.corrupt_on_flush.take(),
        }))
    }
}

struct FixtureTarget {
    file: File,
    capacity: u64,
    fail_write_at: Option<u64>,
    write_delay: Option<Duration>,
    corrupt_on_flush: Option<u64>,
}

impl BlockTarget for FixtureTarget {
    fn capacity_bytes(&mut self) -> io::Result<u64> {
        Ok(self.capacity)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        if let Some(delay) = self.write_delay {
            std::thread::sleep(delay);
        }
        if let Some(fail) = self.fail_write_at {
            if offset <= fail && fail < offset + buf.len() as u64 {
                self.fail_write_at = None;
                return Err(io::Error::other("simulated device error"));
            }
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(offset) = self.corrupt_on_flush.take() {
            let mut byte = [0u8; 1];
            self.read_at(offset, &mut byte)?;
            byte[0] ^= 0xFF;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&byte)?;
        }
        self.file.flush()
    }
}

/// Creates an image file filled with a deterministic non-zero pattern.
pub(crate) fn make_patterned_image(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..size).map(|i| (i % 251) as u8 | 1).collect();
    std::fs::write(&path, bytes).expect("write image fixture");
    path
}

/// Creates a minimal ISO 9660 image: zeros with a primary volume descriptor
/// header at sector 16.
pub(crate) fn make_iso_image(dir: &Path, name: &str, size: usize) -> PathBuf {
    assert!(size >= 17 * 2048);
    let path = dir.join(name);
    let mut bytes = vec![0u8; size];
    let pvd = 16 * 2048;
    bytes[pvd] = 1; // volume descriptor type: primary
    bytes[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
    bytes[pvd + 6] = 1; // version
    std::fs::write(&path, bytes).expect("write iso fixture");
    path
}

/// Creates an image with an MBR boot sector and the given partition
/// entries, each a `(first_lba, sector_count)` pair.
pub(crate) fn make_mbr_image(
    dir: &Path,
    name: &str,
    size: usize,
    partitions: &[(u32, u32)],
) -> PathBuf {
    assert!(size >= 512);
    let path = dir.join(name);
    let mut bytes = vec![0u8; size];
    for (i, (first_lba, sectors)) in partitions.iter().enumerate() {
        let entry = 446 + i * 16;
        bytes[entry + 4] = 0x83; // partition type: Linux
        bytes[entry + 8..entry + 12].copy_from_slice(&first_lba.to_le_bytes());
        bytes[entry + 12..entry + 16].copy_from_slice(&sectors.to_le_bytes());
    }
    bytes[510] = 0x55;
    bytes[511] = 0xAA;
    std::fs::write(&path, bytes).expect("write mbr fixture");
    path
}
