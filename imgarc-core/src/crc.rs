//! CRC32 accumulation for byte streams.
//!
//! [`CrcStream`] sits between a producer and a consumer and folds every byte
//! that crosses it into a running CRC32. It neither buffers nor reorders, so
//! the checksum always matches the exact byte order seen by the inner stream.
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A resettable CRC32 accumulator.
#[derive(Clone, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `bytes` into the running checksum.
    pub fn append(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Returns the checksum of everything appended since the last reset.
    pub fn current(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.hasher.reset();
    }
}

/// One-shot CRC32 of a byte slice.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// A pass-through wrapper that checksums every byte read from or written to
/// the inner stream.
///
/// Only the bytes the inner stream actually accepted (for writes) or produced
/// (for reads) are counted. Seeking is forwarded untouched and does not
/// affect the checksum.
pub struct CrcStream<T> {
    inner: T,
    crc: Crc32,
}

impl<T> CrcStream<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            crc: Crc32::new(),
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc.current()
    }

    pub fn reset_crc(&mut self) {
        self.crc.reset();
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Read for CrcStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc.append(&buf[..n]);
        Ok(n)
    }
}

impl<T: Write> Write for CrcStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.append(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<T: Seek> Seek for CrcStream<T> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Vec<u8> {
        (0..10_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect()
    }

    #[test]
    fn chunking_does_not_change_the_checksum() {
        let data = sample();
        let expected = checksum(&data);

        for chunk in [1usize, 7, 4096] {
            let mut writer = CrcStream::new(Vec::new());
            for part in data.chunks(chunk) {
                writer.write_all(part).unwrap();
            }
            assert_eq!(writer.crc(), expected, "write chunk size {chunk}");
            assert_eq!(writer.into_inner(), data);

            let mut reader = CrcStream::new(Cursor::new(data.clone()));
            let mut buf = vec![0u8; chunk];
            while reader.read(&mut buf).unwrap() > 0 {}
            assert_eq!(reader.crc(), expected, "read chunk size {chunk}");
        }
    }

    #[test]
    fn only_bytes_actually_read_are_counted() {
        let data = b"short".to_vec();
        let mut reader = CrcStream::new(Cursor::new(data.clone()));
        let mut buf = [0xAAu8; 64];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(reader.crc(), checksum(&data));
    }

    #[test]
    fn reset_restores_the_identity_state() {
        let mut crc = Crc32::new();
        crc.append(b"discarded");
        crc.reset();
        crc.append(b"123456789");
        assert_eq!(crc.current(), 0xCBF4_3926);
        // current() must not consume the state
        assert_eq!(crc.current(), 0xCBF4_3926);
    }

    #[test]
    fn stream_reset_starts_a_new_checksum() {
        let mut writer = CrcStream::new(Vec::new());
        writer.write_all(b"header").unwrap();
        assert_eq!(writer.crc(), checksum(b"header"));
        writer.reset_crc();
        writer.write_all(b"123456789").unwrap();
        assert_eq!(writer.crc(), 0xCBF4_3926);
        // Resetting only touches the checksum, never the bytes passed through.
        assert_eq!(writer.into_inner(), b"header123456789");
    }

    #[test]
    fn order_matters() {
        assert_ne!(checksum(b"ab"), checksum(b"ba"));
    }
}
