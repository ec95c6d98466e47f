use crate::config::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::{Bitmap, FileSystem, FsError, Inode};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};
use spin::Mutex;

/// Tracks which sectors of the device are in use.
///
/// Every change is written through to the free-map file (the inode at
/// [`FREE_MAP_SECTOR`]) once one is attached. A claim whose write-back
/// fails is undone before the call returns.
pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

struct FreeMapInner {
    bitmap: Bitmap,
    file: Option<Arc<Inode>>,
}

impl FreeMapInner {
    fn persist(&self) -> Result<(), FsError> {
        let file = match &self.file {
            Some(file) => file,
            // nothing to write back to yet while formatting
            None => return Ok(()),
        };
        let mut buf = vec![0u8; self.bitmap.file_size()];
        self.bitmap.write_bytes(&mut buf);
        if file.write_in_place(0, &buf) == buf.len() {
            Ok(())
        } else {
            Err(FsError::PersistFailed)
        }
    }
}

impl FreeMap {
    /// An in-memory map of `total_sectors` with the free-map and root
    /// directory sectors reserved.
    pub fn new(total_sectors: u32) -> Self {
        let mut bitmap = Bitmap::new(total_sectors as usize);
        bitmap.mark(FREE_MAP_SECTOR as usize);
        bitmap.mark(ROOT_DIR_SECTOR as usize);
        Self {
            inner: Mutex::new(FreeMapInner { bitmap, file: None }),
        }
    }

    /// Claim `cnt` consecutive sectors, first fit. Returns the first one.
    pub fn allocate(&self, cnt: usize) -> Option<u32> {
        let mut inner = self.inner.lock();
        let first = inner.bitmap.scan_and_flip(0, cnt, false)?;
        if let Err(err) = inner.persist() {
            inner.bitmap.set_multiple(first, cnt, false);
            warn!("free map: allocate {} at {}: {}", cnt, first, err);
            return None;
        }
        debug!("free map: allocate {} sector(s) at {}", cnt, first);
        Some(first as u32)
    }

    /// Claim `cnt` sectors anywhere on the device, all or nothing.
    pub fn allocate_scattered(&self, cnt: usize) -> Result<Vec<u32>, FsError> {
        let mut inner = self.inner.lock();
        let total = inner.bitmap.len();
        let sectors: Vec<usize> = (0..total)
            .filter(|bit| !inner.bitmap.test(*bit))
            .take(cnt)
            .collect();
        if sectors.len() < cnt {
            warn!("free map: {} sector(s) requested, {} free", cnt, sectors.len());
            return Err(FsError::NoSpace);
        }
        for sector in sectors.iter() {
            inner.bitmap.mark(*sector);
        }
        if let Err(err) = inner.persist() {
            for sector in sectors.iter() {
                inner.bitmap.reset(*sector);
            }
            warn!("free map: allocate {} scattered: {}", cnt, err);
            return Err(err);
        }
        debug!("free map: allocate {} scattered sector(s)", cnt);
        Ok(sectors.into_iter().map(|s| s as u32).collect())
    }

    /// Return `cnt` consecutive sectors starting at `sector`.
    ///
    /// Panics if any of them is not allocated.
    pub fn release(&self, sector: u32, cnt: usize) {
        let mut inner = self.inner.lock();
        assert!(
            inner.bitmap.all(sector as usize, cnt),
            "releasing free sector(s) {}..{}",
            sector,
            sector as usize + cnt
        );
        inner.bitmap.set_multiple(sector as usize, cnt, false);
        if let Err(err) = inner.persist() {
            warn!("free map: release {} at {}: {}", cnt, sector, err);
        }
        debug!("free map: release {} sector(s) at {}", cnt, sector);
    }

    /// Return every sector in `sectors`, written back once.
    ///
    /// Panics if any of them is not allocated.
    pub fn release_many(&self, sectors: &[u32]) {
        let mut inner = self.inner.lock();
        for sector in sectors.iter() {
            assert!(
                inner.bitmap.test(*sector as usize),
                "releasing free sector {}",
                sector
            );
            inner.bitmap.reset(*sector as usize);
        }
        if let Err(err) = inner.persist() {
            warn!("free map: release {} sector(s): {}", sectors.len(), err);
        }
        debug!("free map: release {} sector(s)", sectors.len());
    }

    /// Number of free sectors
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.bitmap.count(0, inner.bitmap.len(), false)
    }

    /// Whether `sector` is in use
    pub fn is_allocated(&self, sector: u32) -> bool {
        self.inner.lock().bitmap.test(sector as usize)
    }

    /// Number of sectors tracked
    pub fn total(&self) -> usize {
        self.inner.lock().bitmap.len()
    }

    /// The attached free-map file, if any
    pub fn backing_file(&self) -> Option<Arc<Inode>> {
        self.inner.lock().file.clone()
    }

    /// Create the free-map file on a fresh device and write the map to it.
    pub fn create(&self, fs: &Arc<FileSystem>) {
        let size = self.inner.lock().bitmap.file_size();
        if let Err(err) = Inode::create(fs, FREE_MAP_SECTOR, size, false) {
            panic!("free map file creation failed: {}", err);
        }
        let file = fs.open_inode(FREE_MAP_SECTOR);
        let mut inner = self.inner.lock();
        inner.file = Some(file);
        if let Err(err) = inner.persist() {
            panic!("can't write free map: {}", err);
        }
    }

    /// Load the map from the free-map file of a formatted device.
    pub fn open(&self, fs: &Arc<FileSystem>) {
        let file = fs.open_inode(FREE_MAP_SECTOR);
        let mut inner = self.inner.lock();
        let size = inner.bitmap.file_size();
        assert_eq!(
            file.length(),
            size,
            "free map file does not match a device of {} sectors",
            inner.bitmap.len()
        );
        let mut buf = vec![0u8; size];
        assert_eq!(file.read_at(0, &mut buf), size, "can't read free map");
        inner.bitmap.read_bytes(&buf);
        inner.file = Some(file);
    }

    /// Write the map back and close the free-map file.
    pub fn close(&self) {
        let file = {
            let mut inner = self.inner.lock();
            if let Err(err) = inner.persist() {
                warn!("free map: close: {}", err);
            }
            inner.file.take()
        };
        if let Some(file) = file {
            file.close();
        }
    }
}
