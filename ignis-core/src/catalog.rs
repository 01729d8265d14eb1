//! Device discovery and raw access.
//!
//! [`DeviceCatalog`] is the seam between the engine and the platform device
//! layer. The engine only ever talks to this trait, which is what makes the
//! whole write pipeline testable against plain files.

use std::io;
use std::path::Path;

use crate::device::{BlockTarget, DeviceDescriptor, DeviceId, FileTarget};
use crate::error::EngineError;
use crate::platform;

/// Enumerates removable devices and opens them for raw access.
///
/// Enumeration performs no locking and may run concurrently with an active
/// write session; it only reads metadata, never device content.
pub trait DeviceCatalog: Send + Sync {
    /// Returns a snapshot of the removable block devices currently present.
    ///
    /// An empty list is a successful result, distinct from an
    /// [`EngineError::Enumeration`] failure of the platform layer itself.
    /// Non-removable devices are filtered out here as a safety policy.
    fn list_removable_devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError>;

    /// Re-resolves a device id to a fresh descriptor, or `None` if the
    /// device is gone. The engine calls this immediately before writing to
    /// guard against the device being swapped between enumeration and
    /// execution.
    fn probe(&self, id: &DeviceId) -> Result<Option<DeviceDescriptor>, EngineError>;

    /// Opens the device for exclusive raw read/write access.
    fn open_target(&self, id: &DeviceId) -> Result<Box<dyn BlockTarget>, EngineError>;
}

/// The production catalog, backed by the operating system's device layer.
#[derive(Debug, Default)]
pub struct SystemCatalog;

impl SystemCatalog {
    pub fn new() -> Self {
        SystemCatalog
    }
}

impl DeviceCatalog for SystemCatalog {
    fn list_removable_devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        platform::get_removable_devices()
    }

    fn probe(&self, id: &DeviceId) -> Result<Option<DeviceDescriptor>, EngineError> {
        let devices = platform::get_removable_devices()?;
        Ok(devices.into_iter().find(|d| &d.id == id))
    }

    fn open_target(&self, id: &DeviceId) -> Result<Box<dyn BlockTarget>, EngineError> {
        let target =
            FileTarget::open_exclusive(Path::new(id.as_str())).map_err(|e| open_error(id, e))?;
        Ok(Box::new(target))
    }
}

fn open_error(id: &DeviceId, err: io::Error) -> EngineError {
    // EBUSY from an O_EXCL block-device open means someone else (a mount,
    // another process) holds the device.
    if err.raw_os_error() == Some(16) {
        return EngineError::DeviceBusy;
    }
    EngineError::Io {
        offset: 0,
        message: format!("cannot open {id}: {err}"),
    }
}
