//! Exclusive, block-aligned streaming access to whole storage devices.
//!
//! The pieces, from the bottom up:
//! - [`RawDevice`]: positional, block-aligned transfers against one device.
//!   Implemented per platform in [`crate::platform`] and by [`MemoryDisk`].
//! - `Engine` (private): turns arbitrary-length reads and writes into
//!   block-aligned transfers using a one-block work buffer.
//! - [`RawDiskStream`]: the public `Read + Write + Seek` stream. Adds
//!   read-ahead and ping-pong write-behind on a single background task.
mod engine;
mod memory;
mod stream;
mod task;

pub use self::memory::MemoryDisk;
pub use self::stream::RawDiskStream;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while opening or driving a device.
///
/// Setup failures (everything except [`DiskError::Io`]) happen before any
/// data is transferred and leave no handle open.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("cannot open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to dismount partition {path}: {source}")]
    DismountPartition { path: PathBuf, source: io::Error },

    #[error("failed to dismount {path}: {source}")]
    Dismount { path: PathBuf, source: io::Error },

    #[error("failed to lock {path}: {source}")]
    Lock { path: PathBuf, source: io::Error },

    #[error("unusable geometry: block size {block_size}, length {length}")]
    Geometry { block_size: usize, length: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Block-level access to a physical (or simulated) device.
///
/// Every `offset` is a multiple of the block size and every buffer length is
/// a whole number of blocks; callers never ask for bytes beyond the device
/// length.
pub trait RawDevice: Send + 'static {
    fn read_blocks(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_blocks(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Pushes written blocks down to the hardware.
    fn sync(&mut self) -> io::Result<()>;

    /// Gives up exclusive access (unlocks the device). Called once, after the
    /// final flush. Handles themselves are closed on drop.
    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Native block size and total length of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    length: u64,
}

impl Geometry {
    /// Validates that `block_size` is a power of two and `length` is a whole
    /// number of blocks.
    pub fn new(block_size: usize, length: u64) -> Result<Self, DiskError> {
        if !block_size.is_power_of_two() || length % block_size as u64 != 0 {
            return Err(DiskError::Geometry { block_size, length });
        }
        Ok(Self { block_size, length })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

/// How a device stream is going to be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    /// Writing always keeps read capability; partial blocks are merged with
    /// read-modify-write.
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_requires_power_of_two_blocks() {
        assert!(Geometry::new(512, 4096).is_ok());
        assert!(Geometry::new(4096, 0).is_ok());
        assert!(Geometry::new(500, 5000).is_err());
        assert!(Geometry::new(0, 0).is_err());
    }

    #[test]
    fn geometry_requires_whole_blocks() {
        assert!(matches!(
            Geometry::new(512, 1000),
            Err(DiskError::Geometry {
                block_size: 512,
                length: 1000
            })
        ));
    }
}
