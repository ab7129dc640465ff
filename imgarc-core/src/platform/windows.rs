use crate::device::Device;
use crate::disk::{Access, DiskError, Geometry, RawDevice};
use crate::os_options::DeviceOpenOptions;
use anyhow::{Result, bail};
use log::info;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::FileExt;
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::ptr;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME,
};

/// Scans for all removable block devices on a Windows system.
///
/// # Errors
///
/// Always fails for now; open a [`Device`] built by hand instead (the path
/// `\\.\PhysicalDriveN`, its partitions as
/// `\\.\GLOBALROOT\Device\HarddiskN\PartitionM`).
pub fn get_removable_devices() -> Result<Vec<Device>> {
    // TODO: Implement device discovery for Windows using the Win32 API.
    // This will likely involve using functions like `SetupDiGetClassDevsW`,
    // `SetupDiEnumDeviceInfo`, and `DeviceIoControl` to query for disk devices
    // and their properties (e.g., removable, size).
    bail!("device discovery is not yet implemented on Windows")
}

/// Sends a control code that takes no buffers.
fn control(file: &File, code: u32) -> io::Result<()> {
    let mut returned = 0u32;
    // SAFETY: the handle is owned by `file`; no input or output buffers.
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as HANDLE,
            code,
            ptr::null(),
            0,
            ptr::null_mut(),
            0,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_volume(path: &Path, access: Access) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(access.writes())
        .device_access()
        .open(path)
}

/// A dismounted, locked `\\.\PhysicalDriveN` handle.
struct WindowsDisk {
    file: File,
    path: PathBuf,
    locked: bool,
    /// Held open until the disk is dropped so the volumes stay dismounted.
    _partitions: Vec<File>,
}

impl RawDevice for WindowsDisk {
    fn read_blocks(&mut self, offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        let mut at = offset;
        while !buf.is_empty() {
            let n = self.file.seek_read(buf, at)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let rest = buf;
            buf = &mut rest[n..];
            at += n as u64;
        }
        Ok(())
    }

    fn write_blocks(&mut self, offset: u64, mut buf: &[u8]) -> io::Result<()> {
        let mut at = offset;
        while !buf.is_empty() {
            let n = self.file.seek_write(buf, at)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
            at += n as u64;
        }
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn release(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        control(&self.file, FSCTL_UNLOCK_VOLUME)?;
        self.locked = false;
        info!("unlocked {}", self.path.display());
        Ok(())
    }
}

/// Takes exclusive control of `device`.
///
/// Every partition volume is opened and dismounted, then the physical drive
/// is opened, dismounted and locked. The partition handles stay open for as
/// long as the drive does. Any failure aborts with nothing left open.
pub fn open_disk(
    device: &Device,
    access: Access,
) -> Result<(Box<dyn RawDevice>, Geometry), DiskError> {
    let geometry = Geometry::new(device.block_size, device.size_bytes)?;

    let mut partitions = Vec::with_capacity(device.partitions.len());
    for path in &device.partitions {
        let dismounted = open_volume(path, Access::ReadWrite)
            .and_then(|file| control(&file, FSCTL_DISMOUNT_VOLUME).map(|()| file));
        match dismounted {
            Ok(file) => {
                info!("dismounted {}", path.display());
                partitions.push(file);
            }
            Err(source) => {
                return Err(DiskError::DismountPartition {
                    path: path.clone(),
                    source,
                });
            }
        }
    }

    let file = open_volume(&device.path, access).map_err(|source| DiskError::Open {
        path: device.path.clone(),
        source,
    })?;
    control(&file, FSCTL_DISMOUNT_VOLUME).map_err(|source| DiskError::Dismount {
        path: device.path.clone(),
        source,
    })?;
    control(&file, FSCTL_LOCK_VOLUME).map_err(|source| DiskError::Lock {
        path: device.path.clone(),
        source,
    })?;
    info!("locked {}", device.path.display());

    let disk = WindowsDisk {
        file,
        path: device.path.clone(),
        locked: true,
        _partitions: partitions,
    };
    Ok((Box::new(disk), geometry))
}
