//! The core, UI-agnostic imaging engine for the `ignis` bootable USB
//! creator.
//!
//! `ignis-core` is designed to be used as a library by any front-end,
//! whether a command-line interface (like `ignis`) or a graphical user
//! interface. It handles device discovery, write planning, high-speed
//! streamed I/O, boot patching, and verification.
//!
//! The library is structured into several key modules:
//! - [`catalog`]: The [`catalog::DeviceCatalog`] seam over the platform
//!   device layer, with the production [`catalog::SystemCatalog`].
//! - [`device`]: Device descriptors and the raw [`device::BlockTarget`]
//!   I/O primitive.
//! - [`source`]: Source image preparation (transparent decompression) and
//!   format sniffing.
//! - [`plan`]: The [`plan::ImagePlanner`], which turns an image, a device,
//!   and options into an ordered, capacity-checked [`plan::WritePlan`].
//! - [`engine`]: The [`engine::WriteEngine`], which executes a plan on a
//!   background thread and reports progress over a channel.
//! - [`verify`]: Post-write verification of every planned region.
//!
//! A session delivers [`engine::Event::Progress`] notifications followed by
//! exactly one [`engine::Event::Finished`], always last. Cancellation is
//! cooperative and leaves the device in an undefined, unbootable state.
//!
//! ## Example: writing an image with progress reporting
//!
//! ```rust,no_run
//! use ignis_core::catalog::{DeviceCatalog, SystemCatalog};
//! use ignis_core::engine::{Event, WriteEngine};
//! use ignis_core::plan::{ImagePlanner, WriteOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(SystemCatalog::new());
//!     let devices = catalog.list_removable_devices()?;
//!     let device = devices.first().expect("no removable devices found");
//!
//!     let plan = ImagePlanner::new().build_plan(
//!         Path::new("path/to/image.iso"),
//!         device,
//!         WriteOptions::default(),
//!         &[],
//!     )?;
//!
//!     let engine = WriteEngine::new(catalog);
//!     let session = engine.execute(plan)?;
//!     for event in session.events().iter() {
//!         match event {
//!             Event::Progress { percentage, message, .. } => {
//!                 println!("{percentage:>3}% {message}");
//!             }
//!             Event::Finished(outcome) => println!("{outcome:?}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod device;
pub mod engine;
pub mod error;
mod os_options;
pub mod plan;
pub mod platform;
pub mod source;
#[cfg(test)]
pub(crate) mod test_fixtures;
pub mod verify;
