use crate::device::{DeviceDescriptor, DeviceId};
use crate::error::EngineError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo;

/// Helper to read a specific attribute file from /sys/block.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Scans for all removable block devices on a Linux system.
///
/// Discovery iterates `/sys/block` and filters to devices that are safe
/// imaging targets:
/// 1.  The main system drive (e.g. `/dev/nvme0n1`) is excluded.
/// 2.  Loop devices are skipped.
/// 3.  The `/sys/block/<device>/removable` flag must be set; it is the most
///     reliable indicator of a USB drive or SD card.
/// 4.  Devices reporting a size of zero are skipped; these are usually
///     empty card readers.
///
/// Returns [`EngineError::Enumeration`] if the system drive cannot be
/// determined or `/sys/block` cannot be read. An empty result is success.
pub fn get_removable_devices() -> Result<Vec<DeviceDescriptor>, EngineError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut system_disk_parent = None;
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev/").join(disk.name());
            system_disk_parent = Some(get_parent_device_path(&path));
            break;
        }
    }
    let system_disk_parent = system_disk_parent
        .ok_or_else(|| EngineError::Enumeration("could not determine system drive".into()))?;

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block")
        .map_err(|e| EngineError::Enumeration(format!("cannot read /sys/block: {e}")))?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        if !is_removable {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        if size_sectors == 0 {
            continue;
        }

        // The /sys/block size attribute is always in 512-byte sectors,
        // regardless of the device's logical block size.
        let capacity_bytes = size_sectors * 512;

        let model = read_sys_file(&device_name, "device/model")
            .unwrap_or_default();

        devices.push(DeviceDescriptor {
            id: DeviceId::new(device_path.to_string_lossy().into_owned()),
            display_label: device_name,
            model,
            capacity_bytes,
            removable: true,
        });
    }

    Ok(devices)
}
