//! The 7z variable-length `NUMBER` encoding.
//!
//! The count of leading one bits in the first byte says how many extra
//! little-endian bytes follow; the remaining low bits of the first byte hold
//! the most significant part of the value. `0xFF` is followed by a plain
//! 8-byte integer.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Writes `value` in the shortest form.
pub fn write_number<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    let mut extra = 0usize;
    while extra < 8 && value >= 1u64 << (7 * (extra + 1)) {
        extra += 1;
    }
    if extra == 8 {
        out.write_u8(0xFF)?;
        return out.write_u64::<LittleEndian>(value);
    }

    let marker = !(0xFFu8 >> extra);
    let high = (value >> (8 * extra)) as u8;
    out.write_u8(marker | high)?;
    for i in 0..extra {
        out.write_u8((value >> (8 * i)) as u8)?;
    }
    Ok(())
}

/// Writes `value` as `0xFF` followed by 8 raw bytes.
///
/// Pack and unpack sizes are always stored this way so the size fields
/// have a fixed layout.
pub fn write_wide_number<W: Write>(out: &mut W, value: u64) -> io::Result<()> {
    out.write_u8(0xFF)?;
    out.write_u64::<LittleEndian>(value)
}

pub fn read_number<R: Read>(input: &mut R) -> io::Result<u64> {
    let first = input.read_u8()?;
    let mut mask = 0x80u8;
    let mut value = 0u64;
    for i in 0..8 {
        if first & mask == 0 {
            let high = u64::from(first & mask.wrapping_sub(1));
            return Ok(value | (high << (8 * i)));
        }
        value |= u64::from(input.read_u8()?) << (8 * i);
        mask >>= 1;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_number(&mut out, value).unwrap();
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(0x7F), [0x7F]);
        assert_eq!(encode(0x80), [0x80, 0x80]);
        assert_eq!(encode(0x3FFF), [0xBF, 0xFF]);
        assert_eq!(encode(0x4000), [0xC0, 0x00, 0x40]);
        assert_eq!(encode(u64::MAX), [0xFF; 9]);
    }

    #[test]
    fn boundaries_decode_back() {
        for bits in 0..64 {
            for value in [1u64 << bits, (1u64 << bits) - 1, (1u64 << bits) + 1] {
                let bytes = encode(value);
                assert_eq!(read_number(&mut bytes.as_slice()).unwrap(), value);
            }
        }
    }

    #[test]
    fn wide_form_is_a_valid_number() {
        let mut out = Vec::new();
        write_wide_number(&mut out, 300).unwrap();
        assert_eq!(out.len(), 9);
        assert_eq!(read_number(&mut out.as_slice()).unwrap(), 300);
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(read_number(&mut [0xC0u8, 0x00].as_slice()).is_err());
    }
}
