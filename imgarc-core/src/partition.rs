//! Just enough MBR parsing to know where the last partition ends.
use crate::disk::RawDiskStream;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use std::io::{self, Seek, SeekFrom};

const TABLE_OFFSET: usize = 446;
const ENTRY_LEN: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const GPT_PROTECTIVE: u8 = 0xEE;

/// One primary partition table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbrEntry {
    pub kind: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    pub fn end_lba(&self) -> u64 {
        u64::from(self.start_lba) + u64::from(self.sectors)
    }
}

/// Returns the used primary entries, or `None` when `sector` does not carry
/// an MBR boot signature.
pub fn parse_mbr(sector: &[u8]) -> Option<Vec<MbrEntry>> {
    if sector.len() < 512 || sector[510..512] != BOOT_SIGNATURE {
        return None;
    }
    let entries = sector[TABLE_OFFSET..TABLE_OFFSET + 4 * ENTRY_LEN]
        .chunks_exact(ENTRY_LEN)
        .map(|entry| MbrEntry {
            kind: entry[4],
            start_lba: LittleEndian::read_u32(&entry[8..12]),
            sectors: LittleEndian::read_u32(&entry[12..16]),
        })
        .filter(|entry| entry.kind != 0)
        .collect();
    Some(entries)
}

/// Size of the device up to the end of its last MBR partition.
///
/// Returns `None` when the device has no MBR, uses GPT, or has no
/// partitions; callers then fall back to the whole device. The result never
/// exceeds the device length. The stream is left at offset 0.
pub fn allocated_size(stream: &mut RawDiskStream) -> io::Result<Option<u64>> {
    let mut sector = vec![0u8; stream.block_size()];
    stream.seek(SeekFrom::Start(0))?;
    stream.read_sector(&mut sector)?;
    stream.seek(SeekFrom::Start(0))?;

    let Some(entries) = parse_mbr(&sector) else {
        debug!("no MBR signature in sector 0");
        return Ok(None);
    };
    if entries.iter().any(|entry| entry.kind == GPT_PROTECTIVE) {
        debug!("protective MBR found, partition table is GPT");
        return Ok(None);
    }
    let Some(end_lba) = entries.iter().map(MbrEntry::end_lba).max() else {
        return Ok(None);
    };

    let size = end_lba
        .saturating_mul(stream.block_size() as u64)
        .min(stream.len());
    info!(
        "{} MBR partition(s), allocated size {size} of {} bytes",
        entries.len(),
        stream.len()
    );
    Ok(Some(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::disk::{Access, MemoryDisk};

    fn mbr(entries: &[(u8, u32, u32)]) -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        for (i, &(kind, start, count)) in entries.iter().enumerate() {
            let at = TABLE_OFFSET + i * ENTRY_LEN;
            sector[at + 4] = kind;
            LittleEndian::write_u32(&mut sector[at + 8..at + 12], start);
            LittleEndian::write_u32(&mut sector[at + 12..at + 16], count);
        }
        sector[510..].copy_from_slice(&BOOT_SIGNATURE);
        sector
    }

    fn stream_with_sector0(sector: &[u8], length: u64) -> RawDiskStream {
        let mut image = vec![0u8; length as usize];
        image[..512].copy_from_slice(sector);
        let disk = MemoryDisk::from_bytes(512, image).unwrap();
        RawDiskStream::from_device(
            Box::new(disk.clone()),
            disk.geometry(),
            Access::Read,
            &StreamConfig::default(),
        )
    }

    #[test]
    fn parses_used_entries_only() {
        let entries = parse_mbr(&mbr(&[(0x0C, 2048, 1000), (0x83, 4096, 50)])).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].end_lba(), 4146);
        assert!(parse_mbr(&[0u8; 512]).is_none());
    }

    #[test]
    fn allocated_size_ends_at_the_last_partition() {
        let mut s = stream_with_sector0(&mbr(&[(0x83, 100, 20), (0x0C, 8, 50)]), 512 * 1024);
        assert_eq!(allocated_size(&mut s).unwrap(), Some(120 * 512));
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn allocated_size_is_clamped_to_the_device() {
        let mut s = stream_with_sector0(&mbr(&[(0x83, 1, 1_000_000)]), 512 * 64);
        assert_eq!(allocated_size(&mut s).unwrap(), Some(512 * 64));
    }

    #[test]
    fn gpt_and_blank_disks_have_no_allocated_size() {
        let mut gpt = stream_with_sector0(&mbr(&[(0xEE, 1, 100)]), 512 * 256);
        assert_eq!(allocated_size(&mut gpt).unwrap(), None);

        let mut blank = stream_with_sector0(&[0u8; 512], 512 * 256);
        assert_eq!(allocated_size(&mut blank).unwrap(), None);

        let mut empty_table = stream_with_sector0(&mbr(&[]), 512 * 256);
        assert_eq!(allocated_size(&mut empty_table).unwrap(), None);
    }
}
