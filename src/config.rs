use bitflags::bitflags;

bitflags! {
    /// Open-time options recognised by the device layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Opens the underlying file read-only; disables the write path.
        const READ_ONLY        = 1 << 0;
        /// Selects the in-memory device variant instead of a disk-backed one.
        const IN_MEMORY        = 1 << 1;
        /// Never attempt mmap, even if the file would otherwise qualify.
        const DISABLE_MMAP      = 1 << 2;
        /// Recompute and store a CRC32 on every page write-back.
        const ENABLE_CRC32      = 1 << 3;
        /// Transparently encrypt/decrypt every page through the device.
        const ENABLE_ENCRYPTION = 1 << 4;
    }
}

impl Default for EnvFlags {
    fn default() -> Self {
        EnvFlags::empty()
    }
}

/// Advisory access pattern hint, passed down to `posix_fadvise`/`madvise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessHint {
    #[default]
    Normal,
    Random,
}

pub const DEFAULT_PAGE_SIZE: u32 = 16 * 1024;
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// The configuration settings of an Environment.
///
/// A passive, value-typed record. Once a `Device` has been opened with a
/// given `EnvConfig`, the configuration is treated as immutable: nothing in
/// this crate mutates a config after `Device::create`/`Device::open` have
/// consumed it.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub flags: EnvFlags,
    pub file_mode: u32,
    pub page_size_bytes: u32,
    pub cache_size_bytes: u64,
    pub file_size_limit_bytes: u64,
    pub filename: String,
    pub encryption_key: [u8; 16],
    pub posix_advice: AccessHint,
    /// Selector for the (out-of-scope) journal's compression algorithm.
    /// Carried through unmodified; never interpreted by the device.
    pub journal_compressor: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            flags: EnvFlags::empty(),
            file_mode: DEFAULT_FILE_MODE,
            page_size_bytes: DEFAULT_PAGE_SIZE,
            cache_size_bytes: DEFAULT_CACHE_SIZE,
            file_size_limit_bytes: u64::MAX,
            filename: String::new(),
            encryption_key: [0u8; 16],
            posix_advice: AccessHint::Normal,
            journal_compressor: 0,
        }
    }
}

impl EnvConfig {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_page_size(mut self, page_size_bytes: u32) -> Self {
        self.page_size_bytes = page_size_bytes;
        self
    }

    pub fn with_file_size_limit(mut self, limit: u64) -> Self {
        self.file_size_limit_bytes = limit;
        self
    }

    pub fn with_encryption_key(mut self, key: [u8; 16]) -> Self {
        self.encryption_key = key;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EnvFlags::READ_ONLY)
    }

    pub fn is_in_memory(&self) -> bool {
        self.flags.contains(EnvFlags::IN_MEMORY)
    }

    pub fn mmap_disabled(&self) -> bool {
        self.flags.contains(EnvFlags::DISABLE_MMAP)
    }

    pub fn crc32_enabled(&self) -> bool {
        self.flags.contains(EnvFlags::ENABLE_CRC32)
    }

    pub fn encryption_enabled(&self) -> bool {
        self.flags.contains(EnvFlags::ENABLE_ENCRYPTION)
    }
}
