use crate::device::Device;
use crate::disk::{Access, DiskError, Geometry, RawDevice};
use crate::os_options::DeviceOpenOptions;
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_read, ioctl_read_bad, request_code_none};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_read_bad!(blksszget, request_code_none!(0x12, 104), libc::c_int);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Partitions show up as subdirectories of `/sys/block/<device>` named after
/// the device (`sdb1`, `mmcblk0p1`).
fn list_partitions(device_name: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(PathBuf::from("/sys/block").join(device_name)) else {
        return Vec::new();
    };
    let mut partitions: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with(device_name) && name.len() > device_name.len())
        .map(|name| PathBuf::from("/dev/").join(name))
        .collect();
    partitions.sort();
    partitions
}

/// Scans for all removable block devices on a Linux system.
///
/// This function discovers devices by iterating through the `/sys/block` directory.
/// It applies several filters to ensure that only suitable, removable devices are
/// returned, excluding the main system drive for safety.
///
/// The filtering logic is as follows:
/// 1.  Find the main system drive (e.g., `/dev/nvme0n1`) and exclude it.
/// 2.  Skip any loop devices (e.g., `loop0`).
/// 3.  Check the `/sys/block/<device>/removable` flag, which is the most reliable
///     indicator of a removable device like a USB drive or SD card.
/// 4.  Check the `/sys/block/<device>/size` to filter out devices that report a size
///     of zero, which often corresponds to empty card readers.
///
/// For each device the logical block size and the partition list are read
/// from sysfs as well.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut system_disk_parent = None;
    for disk in disks.iter() {
        if disk.mount_point() == Path::new("/") {
            let path = PathBuf::from("/dev/").join(disk.name());
            system_disk_parent = Some(get_parent_device_path(&path));
            break;
        }
    }
    let system_disk_parent =
        system_disk_parent.ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        if !is_removable {
            continue;
        }

        // Always in 512-byte units, whatever the logical block size.
        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        if size_sectors == 0 {
            continue;
        }

        let block_size = read_sys_file(&device_name, "queue/logical_block_size")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(512);

        // Try to find a mount point by checking the `sysinfo` list.
        let mut mount_point = "".to_string();
        for disk in disks.iter() {
            if disk.name().to_string_lossy().contains(&device_name) {
                let mp = disk.mount_point().to_string_lossy().to_string();
                if !mp.is_empty() {
                    mount_point = mp;
                    break;
                }
            }
        }

        devices.push(Device {
            path: device_path,
            index: devices.len() as u32,
            partitions: list_partitions(&device_name),
            name: device_name,
            block_size,
            size_bytes: size_sectors * 512,
            mount_point,
        });
    }

    Ok(devices)
}

/// Undoes the octal escapes `/proc/self/mounts` uses for spaces and friends.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points whose source is `source`, most recently mounted first.
fn mounts_of(source: &Path) -> io::Result<Vec<PathBuf>> {
    let table = fs::read_to_string("/proc/self/mounts")?;
    let wanted = fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
    let mut targets: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let from = PathBuf::from(unescape_mount_field(fields.next()?));
            let target = PathBuf::from(unescape_mount_field(fields.next()?));
            let from = fs::canonicalize(&from).unwrap_or(from);
            (from == wanted).then_some(target)
        })
        .collect();
    targets.reverse();
    Ok(targets)
}

fn unmount_all(source: &Path) -> io::Result<()> {
    for target in mounts_of(source)? {
        info!("unmounting {} from {}", source.display(), target.display());
        umount2(&target, MntFlags::empty()).map_err(io::Error::from)?;
    }
    Ok(())
}

/// An exclusively opened and `flock`ed block device (or image file).
struct LinuxDisk {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl RawDevice for LinuxDisk {
    fn read_blocks(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_blocks(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn release(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        // SAFETY: the descriptor is owned by `self.file` and still open.
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } != 0 {
            return Err(io::Error::last_os_error());
        }
        self.locked = false;
        info!("unlocked {}", self.path.display());
        Ok(())
    }
}

/// Length and logical block size of an open device.
///
/// Regular files (disk images) report their length and the block size the
/// caller recorded for them.
fn query_geometry(file: &File, fallback_block_size: usize) -> io::Result<(usize, u64)> {
    let metadata = file.metadata()?;
    if !metadata.file_type().is_block_device() {
        return Ok((fallback_block_size, metadata.len()));
    }

    let fd = file.as_raw_fd();
    let mut length: u64 = 0;
    let mut block_size: libc::c_int = 0;
    // SAFETY: both ioctls only write one integer through the given pointers.
    unsafe {
        blkgetsize64(fd, &mut length).map_err(io::Error::from)?;
        blksszget(fd, &mut block_size).map_err(io::Error::from)?;
    }
    Ok((block_size as usize, length))
}

/// Takes exclusive control of `device`.
///
/// Partitions, then the device itself, are unmounted; the device is opened
/// with `O_EXCL` and locked with `flock(LOCK_EX | LOCK_NB)`. Unmounting needs
/// no handle on Linux, so it happens before the exclusive open (which would
/// otherwise fail on a mounted device). Any failure aborts with nothing left
/// open.
pub fn open_disk(
    device: &Device,
    access: Access,
) -> Result<(Box<dyn RawDevice>, Geometry), DiskError> {
    for partition in &device.partitions {
        unmount_all(partition).map_err(|source| DiskError::DismountPartition {
            path: partition.clone(),
            source,
        })?;
    }
    unmount_all(&device.path).map_err(|source| DiskError::Dismount {
        path: device.path.clone(),
        source,
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(access.writes())
        .device_access()
        .open(&device.path)
        .map_err(|source| DiskError::Open {
            path: device.path.clone(),
            source,
        })?;

    // SAFETY: the descriptor is owned by `file` and open.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        return Err(DiskError::Lock {
            path: device.path.clone(),
            source: io::Error::last_os_error(),
        });
    }
    info!("locked {}", device.path.display());

    let mut disk = LinuxDisk {
        file,
        path: device.path.clone(),
        locked: true,
    };
    let geometry = query_geometry(&disk.file, device.block_size)
        .map_err(DiskError::Io)
        .and_then(|(block_size, length)| Geometry::new(block_size, length));
    match geometry {
        Ok(geometry) => {
            debug!(
                "{}: {} bytes in {}-byte blocks",
                device.path.display(),
                geometry.length(),
                geometry.block_size()
            );
            Ok((Box::new(disk), geometry))
        }
        Err(e) => {
            if let Err(unlock) = disk.release() {
                warn!("failed to unlock {}: {unlock}", device.path.display());
            }
            Err(e)
        }
    }
}
