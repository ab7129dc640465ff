//! Image file formats, chosen by extension.
use crate::archive::{self, Parsed};
use crate::lzma::Properties;
use anyhow::{Context, Result, bail};
use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// A single-file 7z container (`.7z`).
    SevenZip,
    /// A bare LZMA stream with the standalone header (`.lzma`).
    Lzma,
}

impl ImageFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "7z" => Ok(Self::SevenZip),
            "lzma" => Ok(Self::Lzma),
            _ => bail!(
                "unsupported image format '{}': expected a .7z or .lzma file",
                path.display()
            ),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenZip => write!(f, "7z"),
            Self::Lzma => write!(f, "lzma"),
        }
    }
}

/// The 13-byte header of a standalone `.lzma` file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LzmaHeader {
    pub properties: [u8; 5],
    /// [`lzma::UNKNOWN_SIZE`](crate::lzma::UNKNOWN_SIZE) when not recorded.
    pub unpacked_size: u64,
}

impl LzmaHeader {
    /// Reads the header. `None` if the input is too short or the property
    /// byte is out of range.
    pub fn read<R: Read>(input: &mut R) -> io::Result<Option<Self>> {
        let mut properties = [0u8; 5];
        let header = input
            .read_exact(&mut properties)
            .and_then(|()| input.read_u64::<LittleEndian>());
        let unpacked_size = match header {
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        if Properties::decode(properties).is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            properties,
            unpacked_size,
        }))
    }
}

/// What an image file says about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inspection {
    SevenZip(Parsed),
    Lzma(Option<LzmaHeader>),
}

/// Reads the header of the image at `path` without decompressing anything.
pub fn inspect(path: &Path) -> Result<Inspection> {
    let format = ImageFormat::from_path(path)?;
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let inspection = match format {
        ImageFormat::SevenZip => Inspection::SevenZip(archive::parse(&mut reader)?),
        ImageFormat::Lzma => Inspection::Lzma(LzmaHeader::read(&mut reader)?),
    };
    Ok(inspection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        assert_eq!(
            ImageFormat::from_path(Path::new("sd.img.7z")).unwrap(),
            ImageFormat::SevenZip
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("/tmp/SD.IMG.LZMA")).unwrap(),
            ImageFormat::Lzma
        );
        assert!(ImageFormat::from_path(Path::new("sd.img.zip")).is_err());
        assert!(ImageFormat::from_path(Path::new("sd")).is_err());
    }

    #[test]
    fn lzma_header() {
        let mut bytes = vec![0x5D, 0, 0, 0x10, 0];
        bytes.extend_from_slice(&4096u64.to_le_bytes());
        let header = LzmaHeader::read(&mut bytes.as_slice()).unwrap().unwrap();
        assert_eq!(header.unpacked_size, 4096);

        assert_eq!(LzmaHeader::read(&mut &bytes[..7]).unwrap(), None);
        bytes[0] = 0xE1;
        assert_eq!(LzmaHeader::read(&mut bytes.as_slice()).unwrap(), None);
    }
}
