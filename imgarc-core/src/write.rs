//! Contains the logic for writing an image file to a device.
//!
//! This module handles the multi-stage process of restoring, which includes:
//! 1.  Validating the image: container structure, payload CRC and size, all
//!     before the device is touched.
//! 2.  Decompressing the payload straight onto the target device.
//! 3.  Optionally verifying the written data by reading it back.
use crate::archive::{self, InvalidArchive, Parsed};
use crate::bounded::BoundedView;
use crate::config::Config;
use crate::crc::CrcStream;
use crate::device::Device;
use crate::disk::{Access, RawDiskStream};
use crate::format::{ImageFormat, LzmaHeader};
use crate::lzma::{self, Decompression, PropertySource, UNKNOWN_SIZE};
use crate::window::WindowedReader;
use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Why an image was not written. In every case the device was left alone.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid image: {0}")]
    InvalidArchive(InvalidArchive),

    #[error("invalid image: not an LZMA file")]
    InvalidLzmaHeader,

    #[error("image is corrupt: payload CRC mismatch")]
    PayloadCrc,

    #[error("image needs {declared} bytes but the device holds only {capacity}")]
    CapacityExceeded { declared: u64, capacity: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreSummary {
    pub bytes_written: u64,
    /// CRC32 of the bytes written.
    pub crc: u32,
    pub verified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Restored(RestoreSummary),
    Rejected(Rejection),
}

/// How the payload is found and decoded once the image is accepted.
struct Plan {
    source: PropertySource,
    declared: u64,
    payload_offset: u64,
    payload_len: Option<u64>,
    pack_crc: Option<u32>,
    unpacked_crc: Option<u32>,
}

/// Validates the image header. Nothing here touches the device.
fn plan<R: Read + Seek>(
    image: &mut R,
    format: ImageFormat,
    capacity: u64,
) -> io::Result<Result<Plan, Rejection>> {
    let plan = match format {
        ImageFormat::SevenZip => {
            let header = match archive::parse(image)? {
                Parsed::Valid(header) => header,
                Parsed::Invalid(invalid) => return Ok(Err(Rejection::InvalidArchive(invalid))),
            };
            if !archive::verify_payload(&mut *image, &header)? {
                return Ok(Err(Rejection::PayloadCrc));
            }
            Plan {
                source: PropertySource::Explicit {
                    properties: header.coder_properties,
                    unpacked_size: header.unpacked_size,
                },
                declared: header.unpacked_size,
                payload_offset: header.payload_offset(),
                payload_len: Some(header.packed_size),
                pack_crc: Some(header.pack_crc),
                unpacked_crc: header.unpacked_crc,
            }
        }
        ImageFormat::Lzma => {
            image.seek(SeekFrom::Start(0))?;
            let Some(header) = LzmaHeader::read(image)? else {
                return Ok(Err(Rejection::InvalidLzmaHeader));
            };
            Plan {
                source: PropertySource::Standalone,
                declared: header.unpacked_size,
                payload_offset: 0,
                payload_len: None,
                pack_crc: None,
                unpacked_crc: None,
            }
        }
    };

    if plan.declared != UNKNOWN_SIZE && plan.declared > capacity {
        return Ok(Err(Rejection::CapacityExceeded {
            declared: plan.declared,
            capacity,
        }));
    }
    Ok(Ok(plan))
}

/// Restores `image` onto the device produced by `open_disk`.
///
/// This is the device-independent half of [`run`]. The image is validated
/// against `capacity` first; `open_disk` is only called once the image has
/// been accepted, so a rejected image never causes the device to be opened.
/// The disk is closed before returning.
#[allow(clippy::too_many_arguments)]
pub fn restore_stream<R, O, F1, F2>(
    mut image: R,
    format: ImageFormat,
    capacity: u64,
    verify: bool,
    open_disk: O,
    on_write_start: impl FnOnce(u64),
    mut on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    mut on_verify_progress: F2,
) -> Result<Outcome>
where
    R: Read + Seek,
    O: FnOnce() -> Result<RawDiskStream>,
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    let plan = match plan(&mut image, format, capacity)? {
        Ok(plan) => plan,
        Err(rejection) => {
            warn!("image rejected: {rejection}");
            return Ok(Outcome::Rejected(rejection));
        }
    };

    let mut disk = open_disk()?;
    let capacity = disk.len();
    if plan.declared != UNKNOWN_SIZE {
        on_write_start(plan.declared);
    } else {
        on_write_start(capacity);
    }

    // Write stage.
    let (written, crc) = {
        let payload_len = match plan.payload_len {
            Some(len) => len,
            None => image.seek(SeekFrom::End(0))?.saturating_sub(plan.payload_offset),
        };
        let window = WindowedReader::new(&mut image, plan.payload_offset, payload_len)?;
        let mut payload = CrcStream::new(window);
        let mut target = CrcStream::new(&mut disk);

        let written = match lzma::decompress(
            &mut target,
            &mut payload,
            capacity,
            plan.source,
            &mut on_write_progress,
        )? {
            Decompression::Done(written) => written,
            Decompression::ExceedsCapacity { declared, capacity } => {
                drop(target);
                disk.close()?;
                return Ok(Outcome::Rejected(Rejection::CapacityExceeded { declared, capacity }));
            }
        };

        if let Some(expected) = plan.pack_crc {
            // The decoder may stop short of the end marker; the rest still
            // counts towards the payload CRC.
            io::copy(&mut payload, &mut io::sink())?;
            if payload.crc() != expected {
                bail!("image changed while it was being written (payload CRC mismatch)");
            }
        }
        (written, target.crc())
    };

    if let Some(expected) = plan.unpacked_crc {
        if crc != expected {
            bail!("decompressed data CRC {crc:08x} does not match the image ({expected:08x})");
        }
    }
    disk.flush().context("failed to flush the device")?;
    info!("wrote {written} bytes, CRC {crc:08x}");

    // Verify stage.
    if verify {
        on_verify_start(written);
        disk.seek(SeekFrom::Start(0))?;
        let mut view = BoundedView::new(&mut disk, written);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let n = view.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            on_verify_progress(view.position());
        }
        if view.position() != written || view.crc() != crc {
            bail!("Verification failed: CRC mismatch.");
        }
        info!("verified {written} bytes");
    }

    disk.close().context("failed to close the device")?;
    Ok(Outcome::Restored(RestoreSummary {
        bytes_written: written,
        crc,
        verified: verify,
    }))
}

/// Writes an image file to a block device, with optional verification.
///
/// This is the main entry point for the restoring process. It validates the
/// image, then orchestrates the writing and verification stages, reporting
/// progress for each stage via callbacks. The format follows the extension
/// of `image_path` (`.7z` or `.lzma`).
///
/// # Arguments
///
/// * `image_path` - Path to the source image file.
/// * `device` - The target device. It is dismounted and locked while writing.
/// * `verify` - If `true`, a verification pass will be performed after writing.
/// * `config` - Buffer sizes.
/// * `on_write_start` - Closure called when writing begins, providing the total image size.
/// * `on_write_progress` - Closure called with the number of bytes written.
/// * `on_verify_start` - Closure called when verification begins, providing the total image size.
/// * `on_verify_progress` - Closure called with the number of bytes verified.
///
/// # Errors
///
/// An image that fails validation is not an error: it is reported as
/// [`Outcome::Rejected`] and the device is never opened. Errors are returned
/// if:
/// - The image file or device cannot be accessed.
/// - An I/O error occurs during any stage.
/// - The written data does not match the image CRCs.
#[allow(clippy::too_many_arguments)]
pub fn run<F1, F2>(
    image_path: &Path,
    device: &Device,
    verify: bool,
    config: &Config,
    on_write_start: impl FnOnce(u64),
    on_write_progress: F1,
    on_verify_start: impl FnOnce(u64),
    on_verify_progress: F2,
) -> Result<Outcome>
where
    F1: FnMut(u64),
    F2: FnMut(u64),
{
    let format = ImageFormat::from_path(image_path)?;
    let image_file =
        File::open(image_path).with_context(|| format!("cannot open {}", image_path.display()))?;
    let access = if verify {
        Access::ReadWrite
    } else {
        Access::Write
    };

    restore_stream(
        BufReader::new(image_file),
        format,
        device.size_bytes,
        verify,
        || {
            RawDiskStream::open(device, access, &config.stream)
                .with_context(|| format!("cannot take over {}", device.path.display()))
        },
        on_write_start,
        on_write_progress,
        on_verify_start,
        on_verify_progress,
    )
}
