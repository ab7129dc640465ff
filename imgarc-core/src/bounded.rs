//! A length-limited, checksumming view over a device stream.
use crate::crc::Crc32;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Caps reads from `inner` at `max_len` bytes and checksums what is read.
///
/// The imaging path uses this to stop once the useful part of a disk has
/// been captured, and to obtain the CRC32 of the uncompressed image that is
/// stored in the container metadata. Writes are forwarded unchanged.
pub struct BoundedView<S> {
    inner: S,
    max_len: u64,
    position: u64,
    crc: Crc32,
}

impl<S> BoundedView<S> {
    /// Views `inner` from its current position.
    pub fn new(inner: S, max_len: u64) -> Self {
        Self {
            inner,
            max_len,
            position: 0,
            crc: Crc32::new(),
        }
    }

    /// Logical bytes read so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.max_len
    }

    pub fn is_empty(&self) -> bool {
        self.max_len == 0
    }

    /// CRC32 of every byte read through the view.
    pub fn crc(&self) -> u32 {
        self.crc.current()
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Seek> BoundedView<S> {
    /// Views `inner` starting at the absolute `offset`.
    pub fn with_offset(mut inner: S, offset: u64, max_len: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(offset))?;
        Ok(Self::new(inner, max_len))
    }
}

impl<S: Read> Read for BoundedView<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.max_len.saturating_sub(self.position);
        let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..want])?;
        self.crc.append(&buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: Write> Write for BoundedView<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
