use std::fs::OpenOptions;

/// Open flags for taking over a whole device.
pub(crate) trait DeviceOpenOptions {
    fn device_access(&mut self) -> &mut Self;
}

#[cfg(unix)]
impl DeviceOpenOptions for OpenOptions {
    /// `O_EXCL` on a block device fails while anything else holds it open
    /// exclusively, including mounted filesystems.
    fn device_access(&mut self) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.custom_flags(libc::O_EXCL)
    }
}

#[cfg(windows)]
impl DeviceOpenOptions for OpenOptions {
    /// Volume handles must share read and write for dismount and lock to work.
    fn device_access(&mut self) -> &mut Self {
        use std::os::windows::fs::OpenOptionsExt;
        use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};
        self.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
    }
}
