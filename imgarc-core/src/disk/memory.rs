//! An in-memory block device.
use super::{DiskError, Geometry, RawDevice};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A simulated block device backed by a shared byte vector.
///
/// Clones share the same storage, so a test can hand one clone to a
/// [`RawDiskStream`](super::RawDiskStream) and inspect the contents through
/// another. Unlike a regular file, it rejects transfers that are not
/// block-aligned, the way a raw device opened for direct I/O does.
#[derive(Clone)]
pub struct MemoryDisk {
    data: Arc<Mutex<Vec<u8>>>,
    block_size: usize,
    write_fault: Option<Fault>,
    read_fault: Option<Fault>,
    released: Arc<AtomicBool>,
}

/// An injected I/O error for transfers that reach `at`.
#[derive(Clone)]
struct Fault {
    at: u64,
    /// Set once a one-shot fault has fired. `None` fails every time.
    spent: Option<Arc<AtomicBool>>,
}

impl Fault {
    fn hits(&self, offset: u64, len: usize) -> bool {
        if offset + len as u64 <= self.at {
            return false;
        }
        match &self.spent {
            Some(spent) => !spent.swap(true, Ordering::SeqCst),
            None => true,
        }
    }
}

impl MemoryDisk {
    /// A zero-filled disk of `length` bytes.
    pub fn new(block_size: usize, length: u64) -> Result<Self, DiskError> {
        let len = usize::try_from(length).map_err(|_| DiskError::Geometry { block_size, length })?;
        Self::from_bytes(block_size, vec![0; len])
    }

    pub fn from_bytes(block_size: usize, data: Vec<u8>) -> Result<Self, DiskError> {
        Geometry::new(block_size, data.len() as u64)?;
        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            block_size,
            write_fault: None,
            read_fault: None,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Makes any write touching `offset` or beyond fail with an I/O error.
    pub fn fail_writes_at(mut self, offset: u64) -> Self {
        self.write_fault = Some(Fault {
            at: offset,
            spent: None,
        });
        self
    }

    /// Fails only the first write touching `offset` or beyond.
    pub fn fail_write_once_at(mut self, offset: u64) -> Self {
        self.write_fault = Some(Fault {
            at: offset,
            spent: Some(Arc::new(AtomicBool::new(false))),
        });
        self
    }

    /// Fails only the first read touching `offset` or beyond.
    pub fn fail_read_once_at(mut self, offset: u64) -> Self {
        self.read_fault = Some(Fault {
            at: offset,
            spent: Some(Arc::new(AtomicBool::new(false))),
        });
        self
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            length: self.data.lock().len() as u64,
        }
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Whether a stream has released (unlocked) this disk.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn check(&self, offset: u64, len: usize) -> io::Result<usize> {
        let bs = self.block_size as u64;
        if offset % bs != 0 || len as u64 % bs != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unaligned transfer of {len} bytes at {offset}"),
            ));
        }
        let end = offset + len as u64;
        if end > self.data.lock().len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("transfer beyond the device end ({end})"),
            ));
        }
        Ok(offset as usize)
    }
}

impl RawDevice for MemoryDisk {
    fn read_blocks(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = self.check(offset, buf.len())?;
        if self.read_fault.as_ref().is_some_and(|f| f.hits(offset, buf.len())) {
            return Err(io::Error::other(format!("injected read failure at {offset}")));
        }
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let start = self.check(offset, buf.len())?;
        if self.write_fault.as_ref().is_some_and(|f| f.hits(offset, buf.len())) {
            return Err(io::Error::other(format!("injected write failure at {offset}")));
        }
        self.data.lock()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn release(&mut self) -> io::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_transfers() {
        let mut disk = MemoryDisk::new(512, 2048).unwrap();
        let mut buf = [0u8; 512];
        assert!(disk.read_blocks(1, &mut buf).is_err());
        assert!(disk.read_blocks(0, &mut buf[..100]).is_err());
        assert!(disk.read_blocks(2048, &mut buf).is_err());
        assert!(disk.read_blocks(1536, &mut buf).is_ok());
    }

    #[test]
    fn one_shot_faults_fire_once() {
        let mut disk = MemoryDisk::new(512, 2048).unwrap().fail_write_once_at(1024);
        assert!(disk.write_blocks(0, &[1u8; 512]).is_ok());
        assert!(disk.write_blocks(1024, &[2u8; 512]).is_err());
        assert!(disk.write_blocks(1024, &[2u8; 512]).is_ok());

        let mut disk = MemoryDisk::new(512, 2048).unwrap().fail_read_once_at(512);
        let mut buf = [0u8; 1024];
        assert!(disk.read_blocks(0, &mut buf).is_err());
        assert!(disk.read_blocks(0, &mut buf).is_ok());
    }

    #[test]
    fn clones_share_storage() {
        let disk = MemoryDisk::new(512, 1024).unwrap();
        let mut writer = disk.clone();
        writer.write_blocks(512, &[7u8; 512]).unwrap();
        assert_eq!(disk.snapshot()[512..], [7u8; 512]);
    }
}
