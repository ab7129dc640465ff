//! The core, UI-agnostic library for the `imgarc` disk imaging utility.
//!
//! `imgarc-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `imgarc`) or a graphical user interface.
//! It takes exclusive control of a removable block device, streams it through
//! block-aligned read-ahead and write-behind buffers, and stores the contents
//! as an LZMA-compressed single-file 7z container (or a bare `.lzma` stream).
//!
//! The library is structured into several key modules:
//! - [`device`]: Contains the cross-platform `Device` struct.
//! - [`platform`]: Device discovery and exclusive, dismounted device access.
//! - [`disk`]: The pipelined [`RawDiskStream`](disk::RawDiskStream) over a raw
//!   device.
//! - [`archive`] and [`lzma`]: The 7z container codec and its compressor.
//! - [`mod@read`]: Contains the logic for reading data from a device to an image file.
//! - [`mod@write`]: Contains the logic for writing an image file to a device.
//!
//! The primary entry points for imaging operations are the [`read::run`] and
//! [`write::run`] functions. They block until done and report their progress
//! via callbacks, allowing the calling application to display progress in any
//! way it chooses.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use imgarc_core::{config::Config, platform, write};
//! use std::path::Path;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let image_path = Path::new("path/to/sd.img.7z");
//!     let devices = platform::get_removable_devices()?;
//!     let device_to_write = devices.first().expect("No removable devices found.");
//!
//!     let on_write_progress = |bytes_written: u64| {
//!         println!("{} bytes written", bytes_written);
//!     };
//!
//!     let outcome = write::run(
//!         image_path,
//!         device_to_write,
//!         true, // Enable verification
//!         &Config::default(),
//!         |_| {}, // on_write_start
//!         on_write_progress,
//!         |_| {}, // on_verify_start
//!         |_| {}, // on_verify_progress
//!     )?;
//!
//!     match outcome {
//!         write::Outcome::Restored(summary) => println!("Wrote {} bytes", summary.bytes_written),
//!         write::Outcome::Rejected(why) => println!("Refused: {why}"),
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod bounded;
pub mod config;
pub mod crc;
pub mod device;
pub mod disk;
pub mod format;
pub mod lzma;
mod os_options;
pub mod partition;
pub mod platform;
pub mod read;
pub mod window;
pub mod write;
