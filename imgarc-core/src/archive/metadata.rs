//! The metadata block ("next header") for a single-file, single-coder archive.
use super::number::{read_number, write_number, write_wide_number};
use super::{ArchiveEntry, ArchiveHeader, Checkpoint, InvalidArchive};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::io;

const HEADER: u8 = 0x01;
const MAIN_STREAMS_INFO: u8 = 0x04;
const FILES_INFO: u8 = 0x05;
const PACK_INFO: u8 = 0x06;
const UNPACK_INFO: u8 = 0x07;
const SIZE: u8 = 0x09;
const CRC: u8 = 0x0A;
const FOLDER: u8 = 0x0B;
const CODERS_UNPACK_SIZE: u8 = 0x0C;
const NAME: u8 = 0x11;
const MTIME: u8 = 0x14;
const ATTRIBUTES: u8 = 0x15;
const END: u8 = 0x00;

/// One folder, not external, one coder: flag `0x23` (has properties, 3-byte
/// id) and the LZMA coder id `03 01 01`.
const LZMA_FOLDER: [u8; 10] = [END, UNPACK_INFO, FOLDER, 0x01, 0x00, 0x01, 0x23, 0x03, 0x01, 0x01];

const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x20;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// 100 ns ticks since 1601-01-01 UTC.
pub fn to_filetime(time: DateTime<Utc>) -> u64 {
    let ticks = (time.timestamp() + FILETIME_EPOCH_OFFSET) as i128 * TICKS_PER_SECOND as i128
        + i128::from(time.timestamp_subsec_nanos() / 100);
    ticks.clamp(0, i128::from(u64::MAX)) as u64
}

pub fn from_filetime(ticks: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ticks / TICKS_PER_SECOND as u64).ok()? - FILETIME_EPOCH_OFFSET;
    let nanos = (ticks % TICKS_PER_SECOND as u64) as u32 * 100;
    DateTime::from_timestamp(secs, nanos)
}

pub fn encode(entry: &ArchiveEntry, packed_size: u64, pack_crc: u32) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128 + entry.name.len() * 2);

    out.extend_from_slice(&[HEADER, MAIN_STREAMS_INFO]);
    out.extend_from_slice(&[PACK_INFO, 0x00, 0x01, SIZE]);
    write_wide_number(&mut out, packed_size)?;
    out.extend_from_slice(&[CRC, 0x01]);
    out.write_u32::<LittleEndian>(pack_crc)?;

    out.extend_from_slice(&LZMA_FOLDER);
    out.write_u8(entry.coder_properties.len() as u8)?;
    out.extend_from_slice(&entry.coder_properties);
    out.write_u8(CODERS_UNPACK_SIZE)?;
    write_wide_number(&mut out, entry.unpacked_size)?;
    out.extend_from_slice(&[CRC, 0x01]);
    out.write_u32::<LittleEndian>(entry.unpacked_crc)?;
    out.extend_from_slice(&[END, END]);

    out.extend_from_slice(&[FILES_INFO, 0x01]);

    let name: Vec<u16> = entry.name.encode_utf16().collect();
    out.write_u8(NAME)?;
    write_number(&mut out, name.len() as u64 * 2 + 2 + 1)?;
    out.write_u8(0x00)?;
    for unit in name {
        out.write_u16::<LittleEndian>(unit)?;
    }
    out.write_u16::<LittleEndian>(0)?;

    out.extend_from_slice(&[MTIME, 0x0A, 0x01, 0x00]);
    out.write_u64::<LittleEndian>(to_filetime(entry.modified))?;

    out.extend_from_slice(&[ATTRIBUTES, 0x06, 0x01, 0x00]);
    out.write_u32::<LittleEndian>(FILE_ATTRIBUTE_ARCHIVE)?;

    out.extend_from_slice(&[END, END]);
    Ok(out)
}

/// A consuming view over the metadata bytes.
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn expect(&mut self, tags: &[u8], at: Checkpoint) -> Result<(), InvalidArchive> {
        if self.rest.len() < tags.len() {
            return Err(InvalidArchive::Truncated);
        }
        let (head, tail) = self.rest.split_at(tags.len());
        if head != tags {
            return Err(InvalidArchive::Checkpoint(at));
        }
        self.rest = tail;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.rest.len() < n {
            return None;
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Some(head)
    }

    fn peek(&self) -> Option<u8> {
        self.rest.first().copied()
    }

    fn u8(&mut self) -> Result<u8, InvalidArchive> {
        self.rest.read_u8().map_err(|_| InvalidArchive::Truncated)
    }

    fn u32(&mut self) -> Result<u32, InvalidArchive> {
        self.rest
            .read_u32::<LittleEndian>()
            .map_err(|_| InvalidArchive::Truncated)
    }

    fn u64(&mut self) -> Result<u64, InvalidArchive> {
        self.rest
            .read_u64::<LittleEndian>()
            .map_err(|_| InvalidArchive::Truncated)
    }

    fn number(&mut self) -> Option<u64> {
        read_number(&mut self.rest).ok()
    }
}

/// Optional fields after the coder sizes. Missing or unfamiliar content
/// leaves the remaining fields unset.
#[derive(Default)]
struct Tail {
    unpacked_crc: Option<u32>,
    name: Option<String>,
    modified: Option<DateTime<Utc>>,
}

fn read_tail(fields: &mut Fields<'_>, tail: &mut Tail) -> Option<()> {
    if fields.peek() == Some(CRC) {
        fields.take(1)?;
        if fields.u8().ok()? == 0x01 {
            tail.unpacked_crc = Some(fields.u32().ok()?);
        }
    }
    if fields.take(2)? != [END, END] {
        return None;
    }
    if fields.take(1)? != [FILES_INFO] || fields.number()? != 1 {
        return None;
    }

    loop {
        let id = fields.u8().ok()?;
        if id == END {
            return Some(());
        }
        let size = usize::try_from(fields.number()?).ok()?;
        let data = fields.take(size)?;
        match id {
            NAME => tail.name = decode_name(data),
            MTIME => {
                if data.len() >= 10 && data[0] == 0x01 && data[1] == 0x00 {
                    tail.modified = from_filetime(LittleEndian::read_u64(&data[2..10]));
                }
            }
            _ => {}
        }
    }
}

fn decode_name(data: &[u8]) -> Option<String> {
    let (&external, text) = data.split_first()?;
    if external != 0 {
        return None;
    }
    let units: Vec<u16> = text
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16(&units).ok()
}

/// Parses and validates the metadata block.
///
/// `next_offset` comes from the start header; the stored packed size must
/// equal it since the metadata directly follows the payload.
pub fn parse(bytes: &[u8], next_offset: u64) -> Result<ArchiveHeader, InvalidArchive> {
    let mut fields = Fields { rest: bytes };

    fields.expect(&[HEADER, MAIN_STREAMS_INFO], Checkpoint::StreamsInfo)?;
    fields.expect(&[PACK_INFO, 0x00, 0x01, SIZE, 0xFF], Checkpoint::PackInfo)?;
    let packed_size = fields.u64()?;
    fields.expect(&[CRC, 0x01], Checkpoint::PackCrc)?;
    let pack_crc = fields.u32()?;
    fields.expect(&LZMA_FOLDER, Checkpoint::Coder)?;

    let properties_len = fields.u8()?;
    if properties_len != 5 {
        return Err(InvalidArchive::Checkpoint(Checkpoint::PropertiesLength));
    }
    let mut coder_properties = [0u8; 5];
    coder_properties.copy_from_slice(fields.take(5).ok_or(InvalidArchive::Truncated)?);

    fields.expect(&[CODERS_UNPACK_SIZE, 0xFF], Checkpoint::UnpackSize)?;
    let unpacked_size = fields.u64()?;

    if packed_size != next_offset {
        return Err(InvalidArchive::PackedSizeMismatch {
            packed_size,
            next_offset,
        });
    }

    let mut tail = Tail::default();
    let _ = read_tail(&mut fields, &mut tail);

    Ok(ArchiveHeader {
        packed_size,
        unpacked_size,
        coder_properties,
        pack_crc,
        unpacked_crc: tail.unpacked_crc,
        name: tail.name,
        modified: tail.modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry() -> ArchiveEntry {
        ArchiveEntry {
            name: "disk.img".to_string(),
            modified: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            unpacked_size: 1 << 30,
            unpacked_crc: 0x1234_5678,
            coder_properties: [0x5D, 0x00, 0x00, 0x00, 0x04],
        }
    }

    #[test]
    fn fixed_prefix_layout() {
        let bytes = encode(&entry(), 0x4000, 0xCAFEBABE).unwrap();
        assert_eq!(bytes[..7], [0x01, 0x04, 0x06, 0x00, 0x01, 0x09, 0xFF]);
        assert_eq!(bytes[7..15], 0x4000u64.to_le_bytes());
        assert_eq!(bytes[15..17], [0x0A, 0x01]);
        assert_eq!(bytes[17..21], 0xCAFEBABEu32.to_le_bytes());
        assert_eq!(bytes[21..31], LZMA_FOLDER);
        assert_eq!(bytes[31], 5);
        assert_eq!(bytes[37..39], [0x0C, 0xFF]);
        assert_eq!(bytes[bytes.len() - 2..], [0x00, 0x00]);
    }

    #[test]
    fn parse_reads_back_every_field() {
        let e = entry();
        let bytes = encode(&e, 777, 42).unwrap();
        let header = parse(&bytes, 777).unwrap();
        assert_eq!(header.packed_size, 777);
        assert_eq!(header.pack_crc, 42);
        assert_eq!(header.unpacked_size, e.unpacked_size);
        assert_eq!(header.coder_properties, e.coder_properties);
        assert_eq!(header.unpacked_crc, Some(e.unpacked_crc));
        assert_eq!(header.name.as_deref(), Some("disk.img"));
        assert_eq!(header.modified, Some(e.modified));
    }

    #[test]
    fn every_checkpoint_is_enforced() {
        let bytes = encode(&entry(), 777, 42).unwrap();
        let cases = [
            (1, Checkpoint::StreamsInfo),
            (6, Checkpoint::PackInfo),
            (16, Checkpoint::PackCrc),
            (27, Checkpoint::Coder),
            (31, Checkpoint::PropertiesLength),
            (37, Checkpoint::UnpackSize),
        ];
        for (offset, checkpoint) in cases {
            let mut corrupt = bytes.clone();
            corrupt[offset] ^= 0x40;
            assert_eq!(
                parse(&corrupt, 777).unwrap_err(),
                InvalidArchive::Checkpoint(checkpoint),
                "byte {offset}"
            );
        }
    }

    #[test]
    fn packed_size_must_match_offset() {
        let bytes = encode(&entry(), 777, 42).unwrap();
        assert!(matches!(
            parse(&bytes, 778),
            Err(InvalidArchive::PackedSizeMismatch { .. })
        ));
    }

    #[test]
    fn short_metadata_is_truncated() {
        let bytes = encode(&entry(), 777, 42).unwrap();
        assert_eq!(parse(&bytes[..12], 777).unwrap_err(), InvalidArchive::Truncated);
    }

    #[test]
    fn optional_fields_are_lenient() {
        let bytes = encode(&entry(), 777, 42).unwrap();
        // Cut right after the unpack size: the mandatory part is intact.
        let header = parse(&bytes[..47], 777).unwrap();
        assert_eq!(header.unpacked_size, 1 << 30);
        assert_eq!(header.unpacked_crc, None);
        assert_eq!(header.name, None);
    }

    #[test]
    fn filetime_conversion() {
        let unix_epoch = DateTime::from_timestamp(0, 0).unwrap();
        assert_eq!(to_filetime(unix_epoch), 116_444_736_000_000_000);
        assert_eq!(from_filetime(116_444_736_000_000_000), Some(unix_epoch));
    }
}
