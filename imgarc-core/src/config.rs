//! Tunables shared by the imaging and restore paths.

const MIB: usize = 1024 * 1024;

/// Buffer sizes for [`RawDiskStream`](crate::disk::RawDiskStream).
///
/// A size of zero disables the corresponding pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub read_ahead: usize,
    pub write_behind: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_ahead: 32 * MIB,
            write_behind: 16 * MIB,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LzmaConfig {
    /// LZMA dictionary size in bytes.
    pub dict_size: u32,
}

impl Default for LzmaConfig {
    fn default() -> Self {
        Self {
            dict_size: 64 * MIB as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub stream: StreamConfig,
    pub lzma: LzmaConfig,
}

impl Config {
    /// Applies sizes given in MiB, as the command line takes them.
    pub fn with_mib(
        read_buffer: Option<usize>,
        write_buffer: Option<usize>,
        dict: Option<u32>,
    ) -> Self {
        let mut config = Self::default();
        if let Some(mib) = read_buffer {
            config.stream.read_ahead = mib * MIB;
        }
        if let Some(mib) = write_buffer {
            config.stream.write_behind = mib * MIB;
        }
        if let Some(mib) = dict {
            config.lzma.dict_size = mib.saturating_mul(MIB as u32);
        }
        config
    }
}
