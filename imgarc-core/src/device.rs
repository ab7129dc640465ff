use std::fmt;
use std::path::PathBuf;

/// Represents a block device discovered on the system.
///
/// This struct holds cross-platform information about a device, such as its
/// system path, geometry, partitions and mount point. It is populated by the
/// platform-specific discovery functions in the [`crate::platform`] module,
/// and is everything [`RawDiskStream::open`](crate::disk::RawDiskStream::open)
/// needs to take exclusive control of the device.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The system's disk number (`N` in `PhysicalDriveN` on Windows).
    pub index: u32,
    /// Native (logical) block size in bytes.
    pub block_size: usize,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Paths of the device's partitions. Each one is dismounted before the
    /// device is opened.
    pub partitions: Vec<PathBuf>,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    /// The total size of the device in gigabytes (GiB).
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:.1} GB {} partition(s) {}",
            self.path.display(),
            self.size_gb(),
            self.partitions.len(),
            mount_info
        )
    }
}
