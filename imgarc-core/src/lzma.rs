//! LZMA compression of whole images, on top of liblzma's `.lzma` coder.
//!
//! Two framings are supported:
//! - [`Framing::Standalone`]: the classic `.lzma` file. Five property bytes,
//!   the uncompressed length as a little-endian `u64`, then the payload.
//! - [`Framing::Raw`]: payload only. Properties and length live elsewhere
//!   (in a 7z container's metadata).
//!
//! liblzma only speaks the standalone framing, so raw payloads are produced
//! by stripping its header and consumed by putting one back in front.
use crate::config::LzmaConfig;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::{self, Read, Write};
use xz2::stream::{LzmaOptions, Stream};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// liblzma refuses smaller dictionaries.
const MIN_DICT_SIZE: u32 = 4096;

/// Length value meaning "unknown, read until the end marker".
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Property bytes plus the little-endian length.
pub const HEADER_LEN: usize = 13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    Standalone,
    Raw,
}

/// Where the decoder takes its properties and length from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertySource {
    /// Read the 13-byte standalone header from the input.
    Standalone,
    Explicit {
        properties: [u8; 5],
        unpacked_size: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decompression {
    /// All bytes were written; carries the count.
    Done(u64),
    /// The declared length does not fit. Nothing was written.
    ExceedsCapacity { declared: u64, capacity: u64 },
}

/// LZMA coder parameters as stored in the 5 property bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Properties {
    pub lc: u32,
    pub lp: u32,
    pub pb: u32,
    pub dict_size: u32,
}

impl Properties {
    pub fn new(dict_size: u32) -> Self {
        Self {
            lc: 3,
            lp: 0,
            pb: 2,
            dict_size,
        }
    }

    pub fn encode(&self) -> [u8; 5] {
        let mut bytes = [0u8; 5];
        bytes[0] = ((self.pb * 5 + self.lp) * 9 + self.lc) as u8;
        bytes[1..].copy_from_slice(&self.dict_size.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; 5]) -> io::Result<Self> {
        let d = u32::from(bytes[0]);
        if d >= 9 * 5 * 5 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid LZMA properties byte {d:#04x}"),
            ));
        }
        Ok(Self {
            lc: d % 9,
            lp: (d / 9) % 5,
            pb: d / 45,
            dict_size: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        })
    }

    fn options(&self) -> io::Result<LzmaOptions> {
        let mut options = LzmaOptions::new_preset(6)?;
        options
            .dict_size(self.dict_size.max(MIN_DICT_SIZE))
            .literal_context_bits(self.lc)
            .literal_position_bits(self.lp)
            .position_bits(self.pb);
        Ok(options)
    }
}

/// Takes the header liblzma's encoder writes first and replaces it.
///
/// The encoder records an unknown length and may round the dictionary size,
/// so the property bytes are kept from its header and the length is
/// rewritten. With `length == None` nothing is written in its place.
struct HeaderSplit<W> {
    inner: W,
    header: [u8; HEADER_LEN],
    seen: usize,
    length: Option<u64>,
}

impl<W: Write> HeaderSplit<W> {
    fn new(inner: W, length: Option<u64>) -> Self {
        Self {
            inner,
            header: [0; HEADER_LEN],
            seen: 0,
            length,
        }
    }

    fn properties(&self) -> io::Result<[u8; 5]> {
        if self.seen < HEADER_LEN {
            return Err(io::Error::other("encoder produced no header"));
        }
        let mut properties = [0u8; 5];
        properties.copy_from_slice(&self.header[..5]);
        Ok(properties)
    }
}

impl<W: Write> Write for HeaderSplit<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.seen < HEADER_LEN {
            let n = buf.len().min(HEADER_LEN - self.seen);
            self.header[self.seen..self.seen + n].copy_from_slice(&buf[..n]);
            self.seen += n;
            if self.seen == HEADER_LEN {
                if let Some(length) = self.length {
                    self.inner.write_all(&self.header[..5])?;
                    self.inner.write_u64::<LittleEndian>(length)?;
                }
            }
            return Ok(n);
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compresses exactly `input_len` bytes of `input` into `output`.
///
/// `progress` receives the cumulative number of input bytes consumed.
/// Returns the property bytes the payload was encoded with.
pub fn compress<R, W>(
    mut output: W,
    mut input: R,
    input_len: u64,
    config: &LzmaConfig,
    framing: Framing,
    mut progress: impl FnMut(u64),
) -> io::Result<[u8; 5]>
where
    R: Read,
    W: Write,
{
    let properties = Properties::new(config.dict_size);
    let length = (framing == Framing::Standalone).then_some(input_len);
    let stream = Stream::new_lzma_encoder(&properties.options()?)?;
    let split = HeaderSplit::new(&mut output, length);
    let mut encoder = xz2::write::XzEncoder::new_stream(split, stream);
    debug!(
        "compressing {input_len} bytes, dictionary {} bytes",
        config.dict_size
    );

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;
    while total < input_len {
        let want = (input_len - total).min(BUFFER_SIZE as u64) as usize;
        let n = input.read(&mut buffer[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("input ended after {total} of {input_len} bytes"),
            ));
        }
        encoder.write_all(&buffer[..n])?;
        total += n as u64;
        progress(total);
    }

    let mut split = encoder.finish()?;
    split.flush()?;
    split.properties()
}

/// Decompresses `input` into `output`, refusing anything larger than
/// `capacity` bytes.
///
/// `progress` receives the cumulative number of bytes written. A payload
/// that ends before the declared length is an error.
pub fn decompress<R, W>(
    mut output: W,
    mut input: R,
    capacity: u64,
    source: PropertySource,
    mut progress: impl FnMut(u64),
) -> io::Result<Decompression>
where
    R: Read,
    W: Write,
{
    let (properties, declared) = match source {
        PropertySource::Standalone => {
            let mut properties = [0u8; 5];
            input.read_exact(&mut properties)?;
            (properties, input.read_u64::<LittleEndian>()?)
        }
        PropertySource::Explicit {
            properties,
            unpacked_size,
        } => (properties, unpacked_size),
    };
    if declared != UNKNOWN_SIZE && declared > capacity {
        return Ok(Decompression::ExceedsCapacity { declared, capacity });
    }

    let mut header = [0u8; HEADER_LEN];
    header[..5].copy_from_slice(&properties);
    header[5..].copy_from_slice(&declared.to_le_bytes());
    let properties = Properties::decode(properties)?;
    let stream = Stream::new_lzma_decoder(u64::MAX)?;
    let framed = header.as_slice().chain(&mut input);
    let mut decoder = xz2::read::XzDecoder::new_stream(framed, stream);
    debug!(
        "decompressing {} bytes, dictionary {} bytes",
        if declared == UNKNOWN_SIZE {
            "an unknown number of".to_string()
        } else {
            declared.to_string()
        },
        properties.dict_size
    );

    let limit = if declared == UNKNOWN_SIZE {
        capacity
    } else {
        declared
    };
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;
    let mut ended = false;
    loop {
        let want = (limit - total).min(BUFFER_SIZE as u64) as usize;
        if want == 0 {
            break;
        }
        let n = decoder.read(&mut buffer[..want])?;
        if n == 0 {
            if declared == UNKNOWN_SIZE {
                ended = true;
                break;
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("compressed stream ended after {total} of {declared} bytes"),
            ));
        }
        output.write_all(&buffer[..n])?;
        total += n as u64;
        progress(total);
    }

    if declared == UNKNOWN_SIZE && !ended && decoder.read(&mut buffer[..1])? != 0 {
        return Err(io::Error::other(format!(
            "stream is larger than the {capacity}-byte target"
        )));
    }
    output.flush()?;
    Ok(Decompression::Done(total))
}
