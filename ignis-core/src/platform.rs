//! Platform device layer.
//!
//! This module contains the logic for interacting with the operating system
//! to perform tasks that are not cross-platform, primarily discovering
//! removable block devices.
//!
//! It uses conditional compilation (`#[cfg]`) to expose the correct
//! implementation for the target OS. Each submodule exposes the same public
//! API so the rest of the library can use it without worrying about the
//! underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
