//! A reader restricted to a fixed byte range of a seekable source.
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Exposes `[offset, offset + length)` of `inner` as if it were the whole
/// stream.
///
/// Positions are absolute offsets into `inner`. Seeks are clamped into
/// `[offset, offset + length]`, with `SeekFrom::End` measured from the window
/// ceiling. Reads stop at the ceiling and then report end-of-stream.
pub struct WindowedReader<R> {
    inner: R,
    offset: u64,
    length: u64,
    position: u64,
}

impl<R: Seek> WindowedReader<R> {
    /// Wraps `inner` and immediately positions it at `offset`.
    pub fn new(mut inner: R, offset: u64, length: u64) -> io::Result<Self> {
        let ceiling = offset.checked_add(length).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "window end overflows u64")
        })?;
        inner.seek(SeekFrom::Start(offset))?;
        log::debug!("windowed reader over [{offset}, {ceiling})");
        Ok(Self {
            inner,
            offset,
            length,
            position: offset,
        })
    }
}

impl<R> WindowedReader<R> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn ceiling(&self) -> u64 {
        self.offset + self.length
    }

    fn remaining(&self) -> u64 {
        self.ceiling().saturating_sub(self.position)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for WindowedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        let want = buf.len().min(max);
        if want == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..want])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for WindowedReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.position) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.ceiling()) + i128::from(d),
        };
        let clamped = target.clamp(i128::from(self.offset), i128::from(self.ceiling())) as u64;
        self.position = self.inner.seek(SeekFrom::Start(clamped))?;
        Ok(self.position)
    }
}

impl<R: Write> Write for WindowedReader<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
