//! Byte-granular reads and writes built from block-aligned transfers.
use super::{Geometry, RawDevice};
use std::io;

/// The synchronous core of a device stream.
///
/// `position` is the logical byte offset. The device cursor is implicit: it
/// is always `position` rounded down to a block boundary. When `position` is
/// not block-aligned the work buffer belongs to the block containing it:
/// - `loaded`: the buffer mirrors that block as stored on the device, so
///   reads can be served from its tail.
/// - `dirty`: the first `position % block_size` bytes are caller data that
///   has not reached the device yet.
pub(crate) struct Engine {
    device: Box<dyn RawDevice>,
    block_size: usize,
    length: u64,
    position: u64,
    work: Vec<u8>,
    loaded: bool,
    dirty: bool,
}

impl Engine {
    pub(crate) fn new(device: Box<dyn RawDevice>, geometry: Geometry) -> Self {
        Self {
            device,
            block_size: geometry.block_size(),
            length: geometry.length(),
            position: 0,
            work: vec![0; geometry.block_size()],
            loaded: false,
            dirty: false,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.length - self.position
    }

    fn block_offset(&self) -> usize {
        (self.position % self.block_size as u64) as usize
    }

    fn block_start(&self) -> u64 {
        self.position - self.block_offset() as u64
    }

    fn clamp(&self, len: usize) -> usize {
        len.min(usize::try_from(self.remaining()).unwrap_or(usize::MAX))
    }

    /// Fills the work buffer with the block at the aligned `offset`.
    fn load_block(&mut self, offset: u64) -> io::Result<()> {
        self.device.read_blocks(offset, &mut self.work)?;
        self.loaded = true;
        Ok(())
    }

    /// Makes the work buffer mirror the device block under `position`.
    fn ensure_loaded(&mut self) -> io::Result<()> {
        if !self.loaded {
            self.load_block(self.block_start())?;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes. Short only at the end of the device.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = self.clamp(buf.len());
        if want == 0 {
            return Ok(0);
        }
        // Pending caller bytes must be on the device before reading past them.
        self.flush_partial()?;
        let bs = self.block_size;
        let mut done = 0;

        // Tail of the block the position sits in.
        let lead = self.block_offset();
        if lead != 0 {
            self.ensure_loaded()?;
            let n = (bs - lead).min(want);
            buf[..n].copy_from_slice(&self.work[lead..lead + n]);
            self.advance(n);
            done = n;
        }

        // Whole blocks go straight into the caller's buffer.
        let whole = (want - done) / bs * bs;
        if whole > 0 {
            self.device
                .read_blocks(self.position, &mut buf[done..done + whole])?;
            self.advance(whole);
            done += whole;
        }

        // Unaligned remainder: fetch one more block and keep the rest of it.
        let rest = want - done;
        if rest > 0 {
            self.load_block(self.position)?;
            buf[done..want].copy_from_slice(&self.work[..rest]);
            self.position += rest as u64;
            done = want;
        }

        Ok(done)
    }

    /// Writes up to `buf.len()` bytes. Returns 0 once the device is full.
    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let want = self.clamp(buf.len());
        if want == 0 {
            return Ok(0);
        }
        let bs = self.block_size;
        let mut done = 0;

        let lead = self.block_offset();
        if lead != 0 {
            let n = (bs - lead).min(want);
            self.work[lead..lead + n].copy_from_slice(&buf[..n]);
            self.dirty = true;
            self.position += n as u64;
            done = n;
            if self.block_offset() == 0 {
                self.device
                    .write_blocks(self.position - bs as u64, &self.work)?;
                self.dirty = false;
                self.loaded = false;
            }
        }

        let whole = (want - done) / bs * bs;
        if whole > 0 {
            self.device
                .write_blocks(self.position, &buf[done..done + whole])?;
            self.advance(whole);
            done += whole;
        }

        let rest = want - done;
        if rest > 0 {
            self.work[..rest].copy_from_slice(&buf[done..want]);
            self.position += rest as u64;
            self.loaded = false;
            self.dirty = true;
            done = want;
        }

        Ok(done)
    }

    pub(crate) fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write past the end of the device",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Moves an aligned position forward by whole blocks.
    fn advance(&mut self, n: usize) {
        self.position += n as u64;
        if self.block_offset() == 0 {
            self.loaded = false;
        }
    }

    /// Merges a pending partial block into the device (read-modify-write).
    pub(crate) fn flush_partial(&mut self) -> io::Result<()> {
        let lead = self.block_offset();
        if self.dirty && lead != 0 {
            let start = self.block_start();
            let mut block = vec![0; self.block_size];
            self.device.read_blocks(start, &mut block)?;
            block[..lead].copy_from_slice(&self.work[..lead]);
            self.device.write_blocks(start, &block)?;
            self.work.copy_from_slice(&block);
            self.loaded = true;
        }
        self.dirty = false;
        Ok(())
    }

    /// Flushes the partial block and syncs the device.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.flush_partial()?;
        self.device.sync()
    }

    /// Moves to `target` (clamped to the device length), re-fetching the
    /// block under it when it is not aligned.
    pub(crate) fn seek(&mut self, target: u64) -> io::Result<u64> {
        self.flush_partial()?;
        self.position = target.min(self.length);
        self.loaded = false;
        if self.block_offset() != 0 {
            self.load_block(self.block_start())?;
        }
        Ok(self.position)
    }

    /// Forgets the work buffer, including an unwritten partial block.
    pub(crate) fn discard(&mut self) {
        self.dirty = false;
        self.loaded = false;
    }

    pub(crate) fn release(&mut self) -> io::Result<()> {
        self.device.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;

    fn engine(disk: &MemoryDisk) -> Engine {
        Engine::new(Box::new(disk.clone()), disk.geometry())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn unaligned_chunks_read_the_same_bytes() {
        let data = pattern(512 * 9);
        for chunk in [1usize, 3, 100, 511, 512, 513, 1500, 4608] {
            let disk = MemoryDisk::from_bytes(512, data.clone()).unwrap();
            let mut engine = engine(&disk);
            let mut out = Vec::new();
            let mut buf = vec![0u8; chunk];
            loop {
                let n = engine.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, data, "chunk size {chunk}");
        }
    }

    #[test]
    fn partial_block_is_merged_on_flush() {
        let disk = MemoryDisk::from_bytes(512, vec![0xEE; 2048]).unwrap();
        let mut engine = engine(&disk);
        engine.write_all(&[1u8; 700]).unwrap();
        // Only the first full block has reached the device.
        assert_eq!(disk.snapshot()[512..700], [0xEE; 188]);

        engine.flush().unwrap();
        let image = disk.snapshot();
        assert_eq!(image[..700], [1u8; 700]);
        assert_eq!(image[700..], [0xEE; 1348]);
    }

    #[test]
    fn unaligned_seek_then_write_keeps_neighbouring_bytes() {
        let disk = MemoryDisk::from_bytes(512, pattern(1536)).unwrap();
        let original = disk.snapshot();
        let mut engine = engine(&disk);

        engine.seek(600).unwrap();
        engine.write_all(&[9u8; 10]).unwrap();
        engine.flush().unwrap();

        let image = disk.snapshot();
        assert_eq!(image[..600], original[..600]);
        assert_eq!(image[600..610], [9u8; 10]);
        assert_eq!(image[610..], original[610..]);
    }

    #[test]
    fn reads_stop_at_the_device_end() {
        let disk = MemoryDisk::new(512, 1024).unwrap();
        let mut engine = engine(&disk);
        engine.seek(1000).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(engine.read(&mut buf).unwrap(), 24);
        assert_eq!(engine.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_refuse_to_grow_the_device() {
        let disk = MemoryDisk::new(512, 1024).unwrap();
        let mut engine = engine(&disk);
        let err = engine.write_all(&[0u8; 1025]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
