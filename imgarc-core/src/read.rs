//! Contains the logic for reading data from a device to an image file.
use crate::archive::{ArchiveEntry, ArchiveWriter};
use crate::bounded::BoundedView;
use crate::config::{Config, LzmaConfig};
use crate::device::Device;
use crate::disk::{Access, RawDiskStream};
use crate::format::ImageFormat;
use crate::lzma::{self, Framing};
use crate::partition;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::Path;

/// What was captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSummary {
    pub format: ImageFormat,
    /// Bytes read from the device.
    pub unpacked_size: u64,
    /// CRC32 of the bytes read from the device.
    pub unpacked_crc: u32,
    /// Size of the image file.
    pub image_size: u64,
}

/// The name recorded inside a container: the image file name without its
/// last extension (`sd.img.7z` stores `sd.img`).
pub fn entry_name(image_path: &Path) -> String {
    image_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.img".to_string())
}

/// Compresses the first `size` bytes of `source` into `out`.
///
/// This is the device-independent half of [`run`]: `source` is usually a
/// [`RawDiskStream`], but any reader works. `on_progress` receives the number
/// of source bytes consumed so far.
pub fn image_stream<S, W>(
    source: S,
    size: u64,
    out: W,
    format: ImageFormat,
    name: &str,
    config: &LzmaConfig,
    on_progress: impl FnMut(u64),
) -> io::Result<ImageSummary>
where
    S: Read,
    W: Write + Seek,
{
    let mut view = BoundedView::new(source, size);

    let image_size = match format {
        ImageFormat::SevenZip => {
            let mut archive = ArchiveWriter::create(out)?;
            let coder_properties =
                lzma::compress(&mut archive, &mut view, size, config, Framing::Raw, on_progress)?;
            let entry = ArchiveEntry {
                name: name.to_string(),
                modified: Utc::now(),
                unpacked_size: size,
                unpacked_crc: view.crc(),
                coder_properties,
            };
            archive.finish(&entry)?.stream_position()?
        }
        ImageFormat::Lzma => {
            let mut out = out;
            lzma::compress(&mut out, &mut view, size, config, Framing::Standalone, on_progress)?;
            out.stream_position()?
        }
    };

    Ok(ImageSummary {
        format,
        unpacked_size: view.position(),
        unpacked_crc: view.crc(),
        image_size,
    })
}

/// Reads a block device into a compressed image file.
///
/// The device is dismounted and locked for the duration of the read. The
/// output format follows the extension of `image_path` (`.7z` or `.lzma`).
///
/// # Arguments
///
/// * `device` - The device to read from.
/// * `image_path` - The path where the output image file will be created.
/// * `allocated_only` - If `true` and the device has an MBR, stop at the end
///   of the last partition instead of reading the whole device.
/// * `config` - Buffer and dictionary sizes.
/// * `on_read_start` - A closure that is called once at the beginning of the
///   operation, providing the total number of bytes that will be read.
/// * `on_progress` - A closure that is called repeatedly as data is read. It
///   receives the total number of bytes read so far.
///
/// # Errors
///
/// This function will return an error if:
/// - The image format is not supported.
/// - The device cannot be dismounted, opened or locked.
/// - The output file cannot be created.
/// - An I/O error occurs during reading or writing.
///
/// A partially written image file is removed on failure.
pub fn run<F>(
    device: &Device,
    image_path: &Path,
    allocated_only: bool,
    config: &Config,
    on_read_start: impl FnOnce(u64),
    on_progress: F,
) -> Result<ImageSummary>
where
    F: FnMut(u64),
{
    let format = ImageFormat::from_path(image_path)?;
    let mut disk = RawDiskStream::open(device, Access::Read, &config.stream)
        .with_context(|| format!("cannot take over {}", device.path.display()))?;

    let size = if allocated_only {
        partition::allocated_size(&mut disk)?.unwrap_or_else(|| {
            info!("no MBR partition table, reading the whole device");
            disk.len()
        })
    } else {
        disk.len()
    };

    on_read_start(size);

    let image_file = File::create(image_path)
        .with_context(|| format!("cannot create {}", image_path.display()))?;
    let result = image_stream(
        &mut disk,
        size,
        BufWriter::new(image_file),
        format,
        &entry_name(image_path),
        &config.lzma,
        on_progress,
    );
    let closed = disk.close();

    match result.and_then(|summary| closed.map(|()| summary)) {
        Ok(summary) => {
            info!(
                "imaged {} bytes into {} ({} bytes)",
                summary.unpacked_size,
                image_path.display(),
                summary.image_size
            );
            Ok(summary)
        }
        Err(e) => {
            warn!("imaging failed, removing {}", image_path.display());
            if let Err(rm) = fs::remove_file(image_path) {
                warn!("could not remove {}: {rm}", image_path.display());
            }
            Err(e).context("imaging failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn entry_name_drops_the_container_extension() {
        assert_eq!(entry_name(Path::new("/tmp/sd.img.7z")), "sd.img");
        assert_eq!(entry_name(Path::new("card.lzma")), "card");
    }

    #[test]
    fn stops_at_the_requested_size() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let summary = image_stream(
            data.as_slice(),
            4096,
            Cursor::new(Vec::new()),
            ImageFormat::Lzma,
            "x",
            &LzmaConfig { dict_size: 1 << 16 },
            |_| {},
        )
        .unwrap();
        assert_eq!(summary.unpacked_size, 4096);
        assert_eq!(summary.unpacked_crc, crate::crc::checksum(&data[..4096]));
    }
}
