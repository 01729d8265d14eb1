use crate::device::DeviceDescriptor;
use crate::error::EngineError;

/// Scans for all removable block devices on a Windows system.
///
/// # Panics
///
/// This function currently panics because Windows support is not yet
/// implemented.
pub fn get_removable_devices() -> Result<Vec<DeviceDescriptor>, EngineError> {
    // TODO: Implement device discovery for Windows using the Win32 API.
    // This will involve `SetupDiGetClassDevsW`, `SetupDiEnumDeviceInfo`, and
    // `DeviceIoControl` (IOCTL_STORAGE_GET_DEVICE_NUMBER /
    // IOCTL_DISK_GET_LENGTH_INFO) to query disk devices and their
    // removable flag, model, and capacity.
    unimplemented!("Windows support is not yet implemented.");
}
