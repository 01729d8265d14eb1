//! Error types for the imaging engine.
//!
//! Planning errors are returned synchronously from
//! [`crate::plan::ImagePlanner::build_plan`] and never start a session.
//! Runtime errors terminate the session they occur in; the engine never
//! retries on its own. A retry is a fresh `execute()` call.

use std::io;
use thiserror::Error;

/// Errors detected while constructing a [`crate::plan::WritePlan`].
#[derive(Debug, Error)]
pub enum PlanError {
    /// The planned regions do not fit on the target device.
    #[error("insufficient capacity: plan needs {required} bytes but device has {available}")]
    InsufficientCapacity { required: u64, available: u64 },

    /// The source image could not be opened or sized.
    #[error("cannot read source image: {0}")]
    SourceUnreadable(#[source] io::Error),

    /// The source image (or existing device content) does not match any
    /// recognized bootable format. Only raised when the requested options
    /// require format recognition; a plain full-device copy never does.
    #[error("unsupported image format: {0}")]
    UnsupportedImage(String),
}

/// Errors raised by [`crate::catalog::DeviceCatalog`] and the write engine.
///
/// Every variant carries enough detail for the caller to render an
/// actionable message. `Io` and `VerificationMismatch` report absolute
/// device byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The platform device layer is unavailable or failed. An empty but
    /// successful enumeration is not an error.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// Another write session already holds the target device.
    #[error("device is busy with another write session")]
    DeviceBusy,

    /// The device no longer matches the descriptor the plan was built
    /// against (removed, swapped, or resized since enumeration).
    #[error("target device changed since it was selected: {0}")]
    DeviceChanged(String),

    /// A read or write against the device failed.
    #[error("I/O error at device offset {offset}: {message}")]
    Io { offset: u64, message: String },

    /// A written region did not read back as expected. The device content
    /// must be treated as untrusted until a new full write succeeds.
    #[error("verification mismatch in region {region_index} at device offset {offset}")]
    VerificationMismatch { region_index: usize, offset: u64 },

    /// The session was cancelled by the caller. Device content is
    /// undefined/partial; no rollback is attempted.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn io(offset: u64, err: &io::Error) -> Self {
        EngineError::Io {
            offset,
            message: err.to_string(),
        }
    }
}
