use crate::config::ROOT_DIR_SECTOR;
use crate::inode::InodeTable;
use crate::{BlockDevice, BufferCache, FreeMap, FsConfig, FsError, Inode};

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{info, warn};

/// A mounted device: the free map, the buffer cache in front of the
/// device and the table of open inodes.
pub struct FileSystem {
    config: FsConfig,
    free_map: FreeMap,
    cache: BufferCache,
    inodes: InodeTable,
}

impl FileSystem {
    fn new(device: Arc<dyn BlockDevice>, config: FsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            free_map: FreeMap::new(config.total_sectors),
            cache: BufferCache::new(device, config.cache_slots),
            inodes: InodeTable::new(),
        })
    }

    /// Lay out an empty filesystem on `device`: the free-map file and an
    /// empty root directory.
    pub fn format(device: Arc<dyn BlockDevice>, config: FsConfig) -> Arc<Self> {
        info!(
            "idx-fs: format {} sectors, {} cache slots",
            config.total_sectors, config.cache_slots
        );
        let fs = Self::new(device, config);
        fs.free_map.create(&fs);
        if let Err(err) = Inode::create(&fs, ROOT_DIR_SECTOR, 0, true) {
            panic!("root directory creation failed: {}", err);
        }
        fs
    }

    /// Mount a formatted `device`.
    pub fn mount(device: Arc<dyn BlockDevice>, config: FsConfig) -> Arc<Self> {
        let fs = Self::new(device, config);
        fs.free_map.open(&fs);
        info!(
            "idx-fs: mount {} sectors, {} free",
            config.total_sectors,
            fs.free_map.free_count()
        );
        fs
    }

    /// Close the free-map file and write every dirty sector back.
    pub fn unmount(&self) {
        self.free_map.close();
        let open = self.open_inodes();
        if !open.is_empty() {
            warn!("idx-fs: unmount with open inodes {:?}", open);
        }
        self.cache.flush_all();
        info!("idx-fs: unmounted");
    }

    /// Allocate a sector and write a new inode of `length` bytes to it.
    /// Returns the inode's sector.
    pub fn create_inode(&self, length: usize, is_directory: bool) -> Result<u32, FsError> {
        let sector = self.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        if let Err(err) = Inode::create(self, sector, length, is_directory) {
            self.free_map.release(sector, 1);
            return Err(err);
        }
        Ok(sector)
    }

    /// Open the inode at `sector`
    pub fn open_inode(self: &Arc<Self>, sector: u32) -> Arc<Inode> {
        Inode::open(self, sector)
    }

    /// Open the root directory
    pub fn root_inode(self: &Arc<Self>) -> Arc<Inode> {
        Inode::open(self, ROOT_DIR_SECTOR)
    }

    /// Sectors of every open inode, ascending
    pub fn open_inodes(&self) -> Vec<u32> {
        self.inodes.sectors()
    }

    /// The shared buffer cache
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// The sector allocator
    pub fn free_map(&self) -> &FreeMap {
        &self.free_map
    }

    pub(crate) fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    /// Sizing this filesystem was set up with
    pub fn config(&self) -> FsConfig {
        self.config
    }

    /// Number of sectors on the device
    pub fn total_sectors(&self) -> u32 {
        self.config.total_sectors
    }
}
