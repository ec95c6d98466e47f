//! Fixed parameters of the on-disk format and default sizing.

/// Each sector is of 512 bytes.
pub const SECTOR_SIZE: usize = 512;
/// Default number of slots in the buffer cache
pub const CACHE_SIZE: usize = 64;
/// Sector holding the inode of the free-map file
pub const FREE_MAP_SECTOR: u32 = 0;
/// Sector holding the inode of the root directory
pub const ROOT_DIR_SECTOR: u32 = 1;
/// Magic number for sanity check of a disk inode ("INOD")
pub const INODE_MAGIC: u32 = 0x494e4f44;
/// Default device size used by the host tool: 4MiB
pub const DEFAULT_TOTAL_SECTORS: u32 = 8192;

/// Sizing of a mounted filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsConfig {
    /// Number of sectors on the block device
    pub total_sectors: u32,
    /// Number of slots in the buffer cache
    pub cache_slots: usize,
}

impl FsConfig {
    /// A config for a device of `total_sectors` with the default cache size
    pub fn new(total_sectors: u32) -> Self {
        Self {
            total_sectors,
            cache_slots: CACHE_SIZE,
        }
    }

    /// Replace the number of cache slots
    pub fn with_cache_slots(mut self, cache_slots: usize) -> Self {
        self.cache_slots = cache_slots;
        self
    }
}

impl Default for FsConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_SECTORS)
    }
}
