//! The fixed 32-byte start header.
use super::InvalidArchive;
use crate::crc::checksum;
use byteorder::{ByteOrder, LittleEndian};

pub const START_HEADER_LEN: usize = 32;

/// `7z` signature followed by format version 0.4.
pub const SIGNATURE: [u8; 8] = [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04];

/// Location and checksum of the metadata block.
///
/// `next_offset` is relative to the end of the start header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartHeader {
    pub next_offset: u64,
    pub next_size: u64,
    pub next_crc: u32,
}

impl StartHeader {
    /// The header written before the payload: signature, then zeros.
    pub fn placeholder() -> [u8; START_HEADER_LEN] {
        let mut bytes = [0u8; START_HEADER_LEN];
        bytes[..8].copy_from_slice(&SIGNATURE);
        bytes
    }

    pub fn encode(&self) -> [u8; START_HEADER_LEN] {
        let mut bytes = Self::placeholder();
        LittleEndian::write_u64(&mut bytes[12..20], self.next_offset);
        LittleEndian::write_u64(&mut bytes[20..28], self.next_size);
        LittleEndian::write_u32(&mut bytes[28..32], self.next_crc);
        let start_crc = checksum(&bytes[12..32]);
        LittleEndian::write_u32(&mut bytes[8..12], start_crc);
        bytes
    }

    pub fn decode(bytes: &[u8; START_HEADER_LEN]) -> Result<Self, InvalidArchive> {
        if bytes[..8] != SIGNATURE {
            return Err(InvalidArchive::Signature);
        }
        let stored = LittleEndian::read_u32(&bytes[8..12]);
        let actual = checksum(&bytes[12..32]);
        if stored != actual {
            return Err(InvalidArchive::StartHeaderCrc {
                expected: stored,
                actual,
            });
        }
        Ok(Self {
            next_offset: LittleEndian::read_u64(&bytes[12..20]),
            next_size: LittleEndian::read_u64(&bytes[20..28]),
            next_crc: LittleEndian::read_u32(&bytes[28..32]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_container_format() {
        let header = StartHeader {
            next_offset: 0x0102,
            next_size: 0x30,
            next_crc: 0xAABBCCDD,
        };
        let bytes = header.encode();
        assert_eq!(bytes[..8], SIGNATURE);
        assert_eq!(bytes[12..14], [0x02, 0x01]);
        assert_eq!(bytes[20], 0x30);
        assert_eq!(bytes[28..32], [0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(StartHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn corrupted_fields_fail_the_start_crc() {
        let mut bytes = StartHeader {
            next_offset: 10,
            next_size: 20,
            next_crc: 30,
        }
        .encode();
        bytes[21] ^= 1;
        assert!(matches!(
            StartHeader::decode(&bytes),
            Err(InvalidArchive::StartHeaderCrc { .. })
        ));
    }

    #[test]
    fn wrong_signature() {
        let mut bytes = StartHeader::placeholder();
        bytes[1] = b'Z';
        assert_eq!(StartHeader::decode(&bytes), Err(InvalidArchive::Signature));
    }
}
