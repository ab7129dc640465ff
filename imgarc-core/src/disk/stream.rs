use super::engine::Engine;
use super::task::Pending;
use super::{Access, DiskError, Geometry, RawDevice};
use crate::config::StreamConfig;
use crate::device::Device;
use crate::platform;
use log::{debug, error, info};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;

/// A byte stream over an entire block device.
///
/// Opening the stream dismounts and locks the device; closing (or dropping)
/// it flushes everything still buffered and then unlocks and releases the
/// device, even when an earlier step failed.
///
/// Reads and writes may have any length and start at any offset. Internally
/// every transfer is block-aligned. Two optional pipelines overlap device I/O
/// with the caller's work:
/// - **read-ahead**: once the resident buffer is used up, the next buffer's
///   worth of data is fetched on a background thread.
/// - **write-behind**: writes fill one of two buffers; a full buffer is
///   written out in the background while the caller fills the other.
///
/// The engine (device handle, work buffer and cursor) is moved into the
/// background task and only comes back when the task is joined, so there is
/// never more than one task in flight and no buffer is reused early.
pub struct RawDiskStream {
    core: Core,
    geometry: Geometry,
    access: Access,
    position: u64,
    read_ahead: Option<ReadAhead>,
    write_behind: Option<WriteBehind>,
    /// Set when a background transfer fails. The engine cursor no longer
    /// matches the buffered data, so every later transfer is refused.
    failed: Option<Failure>,
    closed: bool,
}

/// The first background error, kept so it can be reported again.
struct Failure {
    kind: io::ErrorKind,
    message: String,
}

impl Failure {
    fn error(&self) -> io::Error {
        io::Error::new(
            self.kind,
            format!("device stream failed earlier: {}", self.message),
        )
    }
}

enum Core {
    Idle(Engine),
    Prefetching(Pending<Prefetched>),
    Flushing(Pending<Flushed>),
    /// A background task panicked and took the engine with it.
    Lost,
}

struct Prefetched {
    engine: Engine,
    buf: Vec<u8>,
    result: io::Result<usize>,
}

struct Flushed {
    engine: Engine,
    buf: Vec<u8>,
    result: io::Result<()>,
}

struct ReadAhead {
    /// `None` while a prefetch owns the buffer.
    buf: Option<Vec<u8>>,
    pos: usize,
    valid: usize,
}

struct WriteBehind {
    active: Vec<u8>,
    fill: usize,
    /// `None` while a flush owns the other buffer.
    spare: Option<Vec<u8>>,
}

fn lost() -> io::Error {
    io::Error::other("device stream is unusable after a background task failure")
}

impl RawDiskStream {
    /// Opens `device` for exclusive access.
    ///
    /// # Errors
    ///
    /// Fails if any partition or the device itself cannot be dismounted, or
    /// the device cannot be opened or locked. Nothing is left open on error.
    pub fn open(device: &Device, access: Access, config: &StreamConfig) -> Result<Self, DiskError> {
        let (raw, geometry) = platform::open_disk(device, access)?;
        info!(
            "opened {} ({} bytes, {}-byte blocks, {:?})",
            device.path.display(),
            geometry.length(),
            geometry.block_size(),
            access
        );
        Ok(Self::from_device(raw, geometry, access, config))
    }

    /// Builds a stream over an already opened and locked device.
    pub fn from_device(
        device: Box<dyn RawDevice>,
        geometry: Geometry,
        access: Access,
        config: &StreamConfig,
    ) -> Self {
        let read_ahead = (access.reads() && config.read_ahead > 0).then(|| ReadAhead {
            buf: Some(vec![0; config.read_ahead]),
            pos: 0,
            valid: 0,
        });
        let write_behind = (access.writes() && config.write_behind > 0).then(|| WriteBehind {
            active: vec![0; config.write_behind],
            fill: 0,
            spare: Some(vec![0; config.write_behind]),
        });

        Self {
            core: Core::Idle(Engine::new(device, geometry)),
            geometry,
            access,
            position: 0,
            read_ahead,
            write_behind,
            failed: None,
            closed: false,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn len(&self) -> u64 {
        self.geometry.length()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.length() == 0
    }

    pub fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    /// The logical position, accounting for buffered data.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads exactly one block at the current position, bypassing read-ahead.
    pub fn read_sector(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if buf.len() != self.geometry.block_size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector buffer must be {} bytes", self.geometry.block_size()),
            ));
        }
        self.require(self.access.reads(), "reading")?;
        self.healthy()?;
        self.drain_writes()?;
        self.discard_read_ahead()?;
        let n = self.settle()?.read(buf)?;
        self.position += n as u64;
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "sector lies beyond the end of the device",
            ));
        }
        Ok(())
    }

    /// Flushes, unlocks and releases the device.
    ///
    /// All steps run even if one fails; the first error is returned.
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn require(&self, allowed: bool, what: &str) -> io::Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("device stream was not opened for {what}"),
            ))
        }
    }

    fn healthy(&self) -> io::Result<()> {
        match &self.failed {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        }
    }

    /// Marks the stream failed and drops everything still buffered.
    fn poison(&mut self, e: io::Error) -> io::Error {
        if self.failed.is_none() {
            error!("device stream failed at offset {}: {e}", self.position);
            self.failed = Some(Failure {
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        if let Some(wb) = self.write_behind.as_mut() {
            wb.fill = 0;
        }
        if let Some(ra) = self.read_ahead.as_mut() {
            ra.pos = 0;
            ra.valid = 0;
        }
        if let Core::Idle(engine) = &mut self.core {
            engine.discard();
        }
        e
    }

    /// Joins any background task and returns the engine.
    ///
    /// A finished prefetch becomes the resident read-ahead data; a finished
    /// flush returns its buffer as the spare. The task's own I/O error, if
    /// any, is reported after the engine is back in place and poisons the
    /// stream.
    fn settle(&mut self) -> io::Result<&mut Engine> {
        match mem::replace(&mut self.core, Core::Lost) {
            Core::Idle(engine) => self.core = Core::Idle(engine),
            Core::Prefetching(task) => {
                let Prefetched {
                    engine,
                    buf,
                    result,
                } = task.join()?;
                self.core = Core::Idle(engine);
                if let Some(ra) = self.read_ahead.as_mut() {
                    ra.pos = 0;
                    ra.valid = *result.as_ref().unwrap_or(&0);
                    ra.buf = Some(buf);
                }
                if let Err(e) = result {
                    return Err(self.poison(e));
                }
            }
            Core::Flushing(task) => {
                let Flushed {
                    engine,
                    buf,
                    result,
                } = task.join()?;
                self.core = Core::Idle(engine);
                if let Some(wb) = self.write_behind.as_mut() {
                    wb.spare = Some(buf);
                }
                if let Err(e) = result {
                    return Err(self.poison(e));
                }
            }
            Core::Lost => return Err(lost()),
        }
        match &mut self.core {
            Core::Idle(engine) => Ok(engine),
            _ => Err(lost()),
        }
    }

    fn take_engine(&mut self) -> io::Result<Engine> {
        match mem::replace(&mut self.core, Core::Lost) {
            Core::Idle(engine) => Ok(engine),
            other => {
                self.core = other;
                Err(io::Error::other("device engine is busy"))
            }
        }
    }

    /// Copies resident read-ahead data into `out`.
    fn take_resident(&mut self, out: &mut [u8]) -> Option<usize> {
        let ra = self.read_ahead.as_mut()?;
        let buf = ra.buf.as_ref()?;
        if ra.pos >= ra.valid {
            return None;
        }
        let n = out.len().min(ra.valid - ra.pos);
        out[..n].copy_from_slice(&buf[ra.pos..ra.pos + n]);
        ra.pos += n;
        self.position += n as u64;
        Some(n)
    }

    /// True when the resident buffer was completely filled and fully consumed,
    /// i.e. the device has more data and the buffer is free again.
    fn read_ahead_drained(&self) -> bool {
        self.read_ahead.as_ref().is_some_and(|ra| {
            ra.buf.as_ref().is_some_and(|buf| ra.valid == buf.len() && ra.pos == ra.valid)
        })
    }

    fn start_prefetch(&mut self) -> io::Result<()> {
        let Some(mut buf) = self.read_ahead.as_mut().and_then(|ra| ra.buf.take()) else {
            return Ok(());
        };
        let engine = match self.take_engine() {
            Ok(engine) => engine,
            Err(e) => {
                if let Some(ra) = self.read_ahead.as_mut() {
                    ra.buf = Some(buf);
                }
                return Err(e);
            }
        };
        if let Some(ra) = self.read_ahead.as_mut() {
            ra.pos = 0;
            ra.valid = 0;
        }
        debug!("prefetching {} bytes from {}", buf.len(), engine.position());
        let task = Pending::spawn("imgarc-prefetch", move || {
            let mut engine = engine;
            let result = engine.read(&mut buf);
            Prefetched {
                engine,
                buf,
                result,
            }
        })?;
        self.core = Core::Prefetching(task);
        Ok(())
    }

    /// Drops resident read-ahead data and rewinds the engine to the logical
    /// position.
    fn discard_read_ahead(&mut self) -> io::Result<()> {
        let resident = self
            .read_ahead
            .as_ref()
            .is_some_and(|ra| ra.pos < ra.valid);
        let in_flight = matches!(self.core, Core::Prefetching(_));
        if !resident && !in_flight {
            return Ok(());
        }
        let position = self.position;
        self.settle()?.seek(position)?;
        if let Some(ra) = self.read_ahead.as_mut() {
            ra.pos = 0;
            ra.valid = 0;
        }
        Ok(())
    }

    /// Swaps the write-behind buffers and writes the full one in the
    /// background. Waits for the previous flush first.
    fn swap_and_flush(&mut self) -> io::Result<()> {
        self.settle()?;
        let Some(wb) = self.write_behind.as_mut() else {
            return Ok(());
        };
        let Some(spare) = wb.spare.take() else {
            return Err(io::Error::other("write-behind buffer is still in use"));
        };
        let full = mem::replace(&mut wb.active, spare);
        let len = mem::take(&mut wb.fill);
        let engine = self.take_engine()?;

        debug!("writing {len} bytes behind at {}", engine.position());
        let task = Pending::spawn("imgarc-flush", move || {
            let mut engine = engine;
            let result = engine.write_all(&full[..len]);
            Flushed {
                engine,
                buf: full,
                result,
            }
        })?;
        self.core = Core::Flushing(task);
        Ok(())
    }

    /// Pushes all write-behind data into the engine (not yet synced).
    fn drain_writes(&mut self) -> io::Result<()> {
        let pending = self.write_behind.as_ref().is_some_and(|wb| wb.fill > 0);
        if !pending && !matches!(self.core, Core::Flushing(_)) {
            return Ok(());
        }
        self.settle()?;
        let (Some(wb), Core::Idle(engine)) = (self.write_behind.as_mut(), &mut self.core) else {
            return Ok(());
        };
        if wb.fill > 0 {
            let written = engine.write_all(&wb.active[..wb.fill]);
            wb.fill = 0;
            if let Err(e) = written {
                return Err(self.poison(e));
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // A failed stream has nothing trustworthy left to write.
        let flushed = self
            .healthy()
            .and_then(|()| self.drain_writes())
            .and_then(|()| {
                if self.access.writes() {
                    self.settle()?.flush()
                } else {
                    Ok(())
                }
            });
        let settled = self.settle().map(|_| ());
        let released = match mem::replace(&mut self.core, Core::Lost) {
            Core::Idle(mut engine) => engine.release(),
            _ => Ok(()),
        };
        info!("device stream closed at offset {}", self.position);
        flushed.and(settled).and(released)
    }
}

impl Read for RawDiskStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.require(self.access.reads(), "reading")?;
        self.healthy()?;
        if out.is_empty() {
            return Ok(0);
        }
        self.drain_writes()?;

        if let Some(n) = self.take_resident(out) {
            if self.read_ahead_drained() {
                self.start_prefetch()?;
            }
            return Ok(n);
        }

        if matches!(self.core, Core::Prefetching(_)) {
            self.settle()?;
            let n = self.take_resident(out).unwrap_or(0);
            if self.read_ahead_drained() {
                self.start_prefetch()?;
            }
            return Ok(n);
        }

        // Nothing resident: transfer straight into the caller's buffer.
        let engine = self.settle()?;
        let n = engine.read(out)?;
        let more = n == out.len() && engine.remaining() > 0;
        self.position += n as u64;
        if more {
            self.start_prefetch()?;
        }
        Ok(n)
    }
}

impl Write for RawDiskStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.require(self.access.writes(), "writing")?;
        self.healthy()?;
        self.discard_read_ahead()?;

        let room = self.geometry.length() - self.position;
        let n = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        if n == 0 {
            return Ok(0);
        }

        if self.write_behind.is_none() {
            let written = self.settle()?.write(&data[..n])?;
            self.position += written as u64;
            return Ok(written);
        }

        let mut rest = &data[..n];
        while !rest.is_empty() {
            let full = match self.write_behind.as_mut() {
                Some(wb) => {
                    let k = (wb.active.len() - wb.fill).min(rest.len());
                    wb.active[wb.fill..wb.fill + k].copy_from_slice(&rest[..k]);
                    wb.fill += k;
                    rest = &rest[k..];
                    self.position += k as u64;
                    wb.fill == wb.active.len()
                }
                None => false,
            };
            if full {
                self.swap_and_flush()?;
            }
        }
        Ok(n)
    }

    /// Waits for background writes, writes out everything buffered (merging a
    /// trailing partial block) and syncs the device.
    fn flush(&mut self) -> io::Result<()> {
        self.healthy()?;
        self.drain_writes()?;
        if self.access.writes() {
            self.settle()?.flush()?;
        }
        Ok(())
    }
}

impl Seek for RawDiskStream {
    /// Seeks are clamped to `[0, len]`. Anything other than a seek to the
    /// current position discards read-ahead data.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let length = i128::from(self.geometry.length());
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.position) + i128::from(d),
            SeekFrom::End(d) => length + i128::from(d),
        };
        let target = target.clamp(0, length) as u64;
        self.healthy()?;
        if target == self.position {
            return Ok(target);
        }

        self.drain_writes()?;
        let at = self.settle()?.seek(target)?;
        if let Some(ra) = self.read_ahead.as_mut() {
            ra.pos = 0;
            ra.valid = 0;
        }
        self.position = at;
        Ok(at)
    }
}

impl Drop for RawDiskStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("closing device stream failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemoryDisk;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn stream(
        disk: &MemoryDisk,
        access: Access,
        read_ahead: usize,
        write_behind: usize,
    ) -> RawDiskStream {
        let config = StreamConfig {
            read_ahead,
            write_behind,
        };
        RawDiskStream::from_device(Box::new(disk.clone()), disk.geometry(), access, &config)
    }

    fn read_in_chunks(stream: &mut RawDiskStream, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn chunking_never_alters_content() {
        for block_size in [512usize, 4096] {
            let data = random_bytes(block_size * 37, block_size as u64);
            for read_ahead in [0usize, 1000, 3 * block_size, 64 * 1024] {
                let chunks = [1, 7, block_size - 1, block_size, block_size + 1, 10_000, data.len()];
                for chunk in chunks {
                    let disk = MemoryDisk::from_bytes(block_size, data.clone()).unwrap();
                    let mut s = stream(&disk, Access::Read, read_ahead, 0);
                    let out = read_in_chunks(&mut s, chunk);
                    assert_eq!(
                        out, data,
                        "block {block_size}, read-ahead {read_ahead}, chunk {chunk}"
                    );
                }
            }
        }
    }

    #[test]
    fn random_chunk_sizes_match_a_single_read() {
        let data = random_bytes(512 * 200, 7);
        let disk = MemoryDisk::from_bytes(512, data.clone()).unwrap();
        let mut s = stream(&disk, Access::Read, 8 * 1024, 0);
        let mut rng = StdRng::seed_from_u64(99);
        let mut out = Vec::new();
        loop {
            let mut buf = vec![0u8; rng.gen_range(1..3000)];
            let n = s.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn seek_discards_read_ahead() {
        let data = random_bytes(512 * 64, 3);
        let disk = MemoryDisk::from_bytes(512, data.clone()).unwrap();
        let mut s = stream(&disk, Access::Read, 4096, 0);

        let mut buf = vec![0u8; 100];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(s.stream_position().unwrap(), 100);

        s.seek(SeekFrom::Start(10_001)).unwrap();
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[10_001..10_101]);

        s.seek(SeekFrom::Current(-50)).unwrap();
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[10_051..10_151]);

        assert_eq!(s.seek(SeekFrom::End(10)).unwrap(), data.len() as u64);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_sector_returns_one_block() {
        let data = random_bytes(4096 * 4, 11);
        let disk = MemoryDisk::from_bytes(4096, data.clone()).unwrap();
        let mut s = stream(&disk, Access::Read, 16 * 1024, 0);
        let mut sector = vec![0u8; 4096];
        s.read_sector(&mut sector).unwrap();
        assert_eq!(sector, data[..4096]);
        assert_eq!(s.position(), 4096);
        assert!(s.read_sector(&mut [0u8; 512]).is_err());
    }

    #[test]
    fn write_behind_matches_one_contiguous_write() {
        let payload = random_bytes(1 + 70_000 + 3 + 131_072 + 5, 21);
        let len = 512 * 512;

        let expected_disk = MemoryDisk::new(512, len).unwrap();
        let mut direct = stream(&expected_disk, Access::Write, 0, 0);
        direct.write_all(&payload).unwrap();
        direct.close().unwrap();

        let disk = MemoryDisk::new(512, len).unwrap();
        let mut s = stream(&disk, Access::Write, 64 * 1024, 64 * 1024);
        let mut at = 0;
        for size in [1usize, 70_000, 3, 131_072, 5] {
            s.write_all(&payload[at..at + size]).unwrap();
            at += size;
        }
        s.flush().unwrap();

        assert_eq!(disk.snapshot(), expected_disk.snapshot());
        assert_eq!(disk.snapshot()[..payload.len()], payload[..]);
        s.close().unwrap();
    }

    #[test]
    fn partial_block_flush_preserves_trailing_bytes() {
        let disk = MemoryDisk::from_bytes(512, vec![0x5A; 4096]).unwrap();
        let mut s = stream(&disk, Access::Write, 0, 1000);
        s.write_all(&[1u8; 1234]).unwrap();
        s.flush().unwrap();
        let image = disk.snapshot();
        assert_eq!(image[..1234], [1u8; 1234]);
        assert!(image[1234..].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn writes_stop_at_the_device_end() {
        let disk = MemoryDisk::new(512, 2048).unwrap();
        let mut s = stream(&disk, Access::Write, 0, 1024);
        let err = s.write_all(&[3u8; 3000]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        s.flush().unwrap();
        assert_eq!(disk.snapshot(), vec![3u8; 2048]);
    }

    #[test]
    fn read_back_after_write_sees_new_data() {
        let disk = MemoryDisk::new(512, 8192).unwrap();
        let mut s = stream(&disk, Access::ReadWrite, 2048, 1024);
        let payload = random_bytes(3000, 5);
        s.write_all(&payload).unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        let mut back = vec![0u8; 3000];
        s.read_exact(&mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn close_releases_the_device() {
        let disk = MemoryDisk::new(512, 4096).unwrap();
        let s = stream(&disk, Access::Read, 1024, 0);
        s.close().unwrap();
        assert!(disk.is_released());

        let disk = MemoryDisk::new(512, 4096).unwrap();
        {
            let mut s = stream(&disk, Access::Read, 1024, 0);
            let mut buf = [0u8; 10];
            s.read_exact(&mut buf).unwrap();
        }
        assert!(disk.is_released());
    }

    #[test]
    fn background_write_failure_propagates_and_still_releases() {
        let disk = MemoryDisk::new(512, 64 * 1024)
            .unwrap()
            .fail_writes_at(8192);
        let mut s = stream(&disk, Access::Write, 0, 4096);
        // The first two buffers land; the third fails in the background and
        // surfaces when the fourth needs the engine back.
        assert!(s.write_all(&[1u8; 16 * 1024]).is_err());
        assert!(s.close().is_err());
        assert!(disk.is_released());
        assert_eq!(disk.snapshot()[..8192], [1u8; 8192]);
    }

    #[test]
    fn failed_write_behind_stops_all_later_writes() {
        let disk = MemoryDisk::new(512, 16 * 1024)
            .unwrap()
            .fail_write_once_at(4096);
        let mut s = stream(&disk, Access::Write, 0, 4096);
        s.write_all(&[1u8; 4096]).unwrap();
        // Goes out in the background and fails there.
        s.write_all(&[2u8; 4096]).unwrap();
        // Needs the engine back, so it collects that failure.
        assert!(s.write_all(&[3u8; 4096]).is_err());
        assert_eq!(s.position(), 3 * 4096);

        // The device would accept these now; the stream must not.
        assert!(s.write_all(&[4u8; 100]).is_err());
        assert!(s.flush().is_err());
        assert!(s.seek(SeekFrom::Start(0)).is_err());
        assert!(s.close().is_err());
        assert!(disk.is_released());

        let data = disk.snapshot();
        assert_eq!(data[..4096], [1u8; 4096]);
        assert!(data[4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_write_behind_skips_the_final_drain() {
        let disk = MemoryDisk::new(512, 16 * 1024)
            .unwrap()
            .fail_write_once_at(0);
        let mut s = stream(&disk, Access::Write, 0, 4096);
        s.write_all(&[5u8; 4096 + 700]).unwrap();
        // The background flush of the first buffer fails; close collects it
        // and must not write the 700 buffered bytes at offset 0.
        assert!(s.close().is_err());
        assert!(disk.is_released());
        assert!(disk.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_prefetch_is_never_skipped() {
        let data = random_bytes(8192, 9);
        let disk = MemoryDisk::from_bytes(512, data.clone())
            .unwrap()
            .fail_read_once_at(2048);
        let mut s = stream(&disk, Access::Read, 1024, 0);
        let mut buf = vec![0u8; 1024];

        // Direct read, then one served from read-ahead that starts the
        // prefetch of [2048, 3072), which fails.
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[..1024]);
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf, data[1024..2048]);

        assert!(s.read(&mut buf).is_err());
        // A retry must not resume past the bytes that were lost.
        assert!(s.read(&mut buf).is_err());
        assert_eq!(s.position(), 2048);
        assert!(s.close().is_err());
        assert!(disk.is_released());
    }

    #[test]
    fn read_only_stream_rejects_writes() {
        let disk = MemoryDisk::new(512, 1024).unwrap();
        let mut s = stream(&disk, Access::Read, 0, 0);
        assert_eq!(
            s.write(&[0u8; 4]).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
    }
}
