//! A single-file 7z container holding one LZMA stream.
//!
//! Only the subset needed to store a disk image is supported: one pack
//! stream, one folder with one LZMA coder, one file entry. Layout:
//!
//! ```text
//! [0, 32)                start header (signature, CRCs, metadata location)
//! [32, 32 + packed)      LZMA payload
//! [32 + packed, ..)      metadata block
//! ```
//!
//! Writing is done with [`ArchiveWriter`], which leaves a placeholder start
//! header, lets the caller stream the payload through it, and then appends
//! the metadata and patches the start header. Reading is done with [`parse`],
//! which reports malformed containers as [`Parsed::Invalid`] rather than as
//! an error.
mod header;
mod metadata;
pub mod number;

pub use self::header::{SIGNATURE, START_HEADER_LEN};

use self::header::StartHeader;
use crate::crc::{CrcStream, checksum};
use crate::window::WindowedReader;
use chrono::{DateTime, Utc};
use log::debug;
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;

/// What the imaging side records about the stored image.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub modified: DateTime<Utc>,
    pub unpacked_size: u64,
    /// CRC32 of the uncompressed image.
    pub unpacked_crc: u32,
    pub coder_properties: [u8; 5],
}

/// A validated container header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub packed_size: u64,
    pub unpacked_size: u64,
    pub coder_properties: [u8; 5],
    /// CRC32 of the packed payload.
    pub pack_crc: u32,
    pub unpacked_crc: Option<u32>,
    pub name: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

impl ArchiveHeader {
    /// Absolute file offset of the packed payload.
    pub fn payload_offset(&self) -> u64 {
        START_HEADER_LEN as u64
    }
}

/// The fixed metadata sequences a container must contain, in file order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checkpoint {
    /// `01 04`
    StreamsInfo,
    /// `06 00 01 09 FF`
    PackInfo,
    /// `0A 01`
    PackCrc,
    /// `00 07 0B 01 00 01 23 03 01 01`
    Coder,
    /// Coder property length `05`.
    PropertiesLength,
    /// `0C FF`
    UnpackSize,
}

/// Why a file is not a usable container.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum InvalidArchive {
    #[error("file is too short to be a 7z container")]
    Truncated,

    #[error("not a 7z container")]
    Signature,

    #[error("start header CRC mismatch (stored {expected:08x}, computed {actual:08x})")]
    StartHeaderCrc { expected: u32, actual: u32 },

    #[error("unsupported container layout at {0:?}")]
    Checkpoint(Checkpoint),

    #[error("packed size {packed_size} does not match metadata offset {next_offset}")]
    PackedSizeMismatch { packed_size: u64, next_offset: u64 },

    #[error("metadata CRC mismatch (stored {expected:08x}, computed {actual:08x})")]
    MetadataCrc { expected: u32, actual: u32 },
}

/// Result of [`parse`]. Only I/O failures are reported as errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parsed {
    Valid(ArchiveHeader),
    Invalid(InvalidArchive),
}

/// Reads and validates the container header from the start of `reader`.
pub fn parse<R: Read + Seek>(reader: &mut R) -> io::Result<Parsed> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut bytes = [0u8; START_HEADER_LEN];
    match reader.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(Parsed::Invalid(InvalidArchive::Truncated));
        }
        Err(e) => return Err(e),
    }
    let start = match StartHeader::decode(&bytes) {
        Ok(start) => start,
        Err(invalid) => return Ok(Parsed::Invalid(invalid)),
    };

    let metadata_at = (START_HEADER_LEN as u64).checked_add(start.next_offset);
    let metadata_end = metadata_at.and_then(|at| at.checked_add(start.next_size));
    let (Some(metadata_at), Some(metadata_end)) = (metadata_at, metadata_end) else {
        return Ok(Parsed::Invalid(InvalidArchive::Truncated));
    };
    if metadata_end > file_len {
        return Ok(Parsed::Invalid(InvalidArchive::Truncated));
    }

    // Bounded by the file length checked above.
    let mut metadata = vec![0u8; start.next_size as usize];
    reader.seek(SeekFrom::Start(metadata_at))?;
    reader.read_exact(&mut metadata)?;

    let header = match metadata::parse(&metadata, start.next_offset) {
        Ok(header) => header,
        Err(invalid) => return Ok(Parsed::Invalid(invalid)),
    };
    let actual = checksum(&metadata);
    if actual != start.next_crc {
        return Ok(Parsed::Invalid(InvalidArchive::MetadataCrc {
            expected: start.next_crc,
            actual,
        }));
    }

    debug!(
        "container: {} packed bytes, {} unpacked bytes",
        header.packed_size, header.unpacked_size
    );
    Ok(Parsed::Valid(header))
}

/// Exposes exactly the packed payload of a parsed container.
pub fn payload<R: Read + Seek>(reader: R, header: &ArchiveHeader) -> io::Result<WindowedReader<R>> {
    WindowedReader::new(reader, header.payload_offset(), header.packed_size)
}

/// Checks the payload against its stored CRC without decompressing it.
pub fn verify_payload<R: Read + Seek>(reader: R, header: &ArchiveHeader) -> io::Result<bool> {
    let mut window = CrcStream::new(payload(reader, header)?);
    let copied = io::copy(&mut window, &mut io::sink())?;
    Ok(copied == header.packed_size && window.crc() == header.pack_crc)
}

/// Streams a container into `out`.
///
/// Payload bytes are written through the writer itself (it implements
/// [`Write`]), which checksums them on the way.
pub struct ArchiveWriter<W: Write + Seek> {
    inner: CrcStream<W>,
    start: u64,
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Writes the placeholder start header at the current position.
    pub fn create(mut out: W) -> io::Result<Self> {
        let start = out.stream_position()?;
        out.write_all(&StartHeader::placeholder())?;
        Ok(Self {
            inner: CrcStream::new(out),
            start,
        })
    }

    /// Appends the metadata for `entry` and patches the start header.
    ///
    /// Returns the underlying writer positioned at the end of the container.
    pub fn finish(self, entry: &ArchiveEntry) -> io::Result<W> {
        let pack_crc = self.inner.crc();
        let mut out = self.inner.into_inner();

        let payload_end = out.stream_position()?;
        let packed_size = payload_end - self.start - START_HEADER_LEN as u64;
        let metadata = metadata::encode(entry, packed_size, pack_crc)?;
        out.write_all(&metadata)?;

        let start = StartHeader {
            next_offset: packed_size,
            next_size: metadata.len() as u64,
            next_crc: checksum(&metadata),
        };
        out.seek(SeekFrom::Start(self.start))?;
        out.write_all(&start.encode())?;
        let end = out.seek(SeekFrom::Start(payload_end + metadata.len() as u64))?;
        out.flush()?;

        debug!("container finished: {packed_size} packed bytes, {end} total");
        Ok(out)
    }
}

impl<W: Write + Seek> Write for ArchiveWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn entry() -> ArchiveEntry {
        ArchiveEntry {
            name: "card.img".to_string(),
            modified: Utc.with_ymd_and_hms(2023, 11, 5, 8, 0, 0).unwrap(),
            unpacked_size: 4096,
            unpacked_crc: 0xDEAD_BEEF,
            coder_properties: [0x5D, 0x00, 0x00, 0x10, 0x00],
        }
    }

    fn container(payload: &[u8]) -> Vec<u8> {
        let mut writer = ArchiveWriter::create(Cursor::new(Vec::new())).unwrap();
        writer.write_all(payload).unwrap();
        writer.finish(&entry()).unwrap().into_inner()
    }

    fn parse_bytes(bytes: Vec<u8>) -> Parsed {
        parse(&mut Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn written_container_parses_back() {
        let data = b"not really lzma, but the container does not care";
        let bytes = container(data);
        assert_eq!(bytes[..8], SIGNATURE);

        let Parsed::Valid(header) = parse_bytes(bytes.clone()) else {
            panic!("container should be valid");
        };
        assert_eq!(header.packed_size, data.len() as u64);
        assert_eq!(header.pack_crc, checksum(data));
        assert_eq!(header.unpacked_size, 4096);
        assert_eq!(header.unpacked_crc, Some(0xDEAD_BEEF));
        assert_eq!(header.coder_properties, entry().coder_properties);
        assert_eq!(header.name.as_deref(), Some("card.img"));
        assert_eq!(header.modified, Some(entry().modified));

        let mut window = payload(Cursor::new(bytes.clone()), &header).unwrap();
        let mut stored = Vec::new();
        window.read_to_end(&mut stored).unwrap();
        assert_eq!(stored, data);
        assert!(verify_payload(Cursor::new(bytes), &header).unwrap());
    }

    #[test]
    fn checkpoints_are_checked_before_the_metadata_crc() {
        let bytes = container(&[7u8; 100]);
        let metadata_at = START_HEADER_LEN + 100;
        for (offset, checkpoint) in [
            (0, Checkpoint::StreamsInfo),
            (5, Checkpoint::PackInfo),
            (15, Checkpoint::PackCrc),
            (21, Checkpoint::Coder),
            (31, Checkpoint::PropertiesLength),
            (38, Checkpoint::UnpackSize),
        ] {
            let mut corrupt = bytes.clone();
            corrupt[metadata_at + offset] = 0x99;
            assert_eq!(
                parse_bytes(corrupt),
                Parsed::Invalid(InvalidArchive::Checkpoint(checkpoint)),
                "metadata byte {offset}"
            );
        }
    }

    #[test]
    fn damaged_optional_metadata_fails_the_crc() {
        let bytes = container(&[1u8; 10]);
        let mut corrupt = bytes.clone();
        let last_name_byte = corrupt.len() - 30;
        corrupt[last_name_byte] ^= 0xFF;
        assert!(matches!(
            parse_bytes(corrupt),
            Parsed::Invalid(InvalidArchive::MetadataCrc { .. })
        ));
    }

    #[test]
    fn truncated_files_are_invalid() {
        let bytes = container(&[1u8; 64]);
        assert_eq!(
            parse_bytes(bytes[..20].to_vec()),
            Parsed::Invalid(InvalidArchive::Truncated)
        );
        assert_eq!(
            parse_bytes(bytes[..bytes.len() - 1].to_vec()),
            Parsed::Invalid(InvalidArchive::Truncated)
        );
    }

    #[test]
    fn oversized_metadata_is_not_allocated() {
        let start = StartHeader {
            next_offset: 0,
            next_size: u64::MAX - 100,
            next_crc: 0,
        };
        assert_eq!(
            parse_bytes(start.encode().to_vec()),
            Parsed::Invalid(InvalidArchive::Truncated)
        );
    }

    #[test]
    fn foreign_files_are_invalid() {
        assert_eq!(
            parse_bytes(vec![0x42; 256]),
            Parsed::Invalid(InvalidArchive::Signature)
        );
    }

    #[test]
    fn corrupted_payload_fails_verification() {
        let mut bytes = container(&[9u8; 500]);
        let Parsed::Valid(header) = parse_bytes(bytes.clone()) else {
            panic!("container should be valid");
        };
        bytes[START_HEADER_LEN + 250] ^= 1;
        assert!(!verify_payload(Cursor::new(bytes), &header).unwrap());
    }
}
