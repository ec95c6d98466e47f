use crate::layout::IndirectBlock;
use crate::{DiskInode, FileSystem, FsError, SECTOR_SIZE};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use log::{debug, warn};
use spin::Mutex;

/// The in-memory handle of an open inode.
///
/// Opening a sector that is already open hands back the same handle, so
/// every opener shares one copy of the metadata and one extension lock.
pub struct Inode {
    sector: u32,
    fs: Arc<FileSystem>,
    /// Serializes growers of this file.
    extension_lock: Mutex<()>,
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    open_count: usize,
    removed: bool,
    deny_write_count: usize,
    disk: DiskInode,
}

/// Handles of every open inode, by sector.
pub(crate) struct InodeTable {
    open: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            open: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn sectors(&self) -> Vec<u32> {
        self.open.lock().keys().copied().collect()
    }
}

impl Inode {
    /// Write a new inode of `length` zero bytes to `sector`.
    ///
    /// The index skeleton (double-indirect table, first indirect table and
    /// first data sector) is claimed up front; on failure every sector
    /// claimed here is given back. `sector` itself belongs to the caller.
    pub fn create(
        fs: &FileSystem,
        sector: u32,
        length: usize,
        is_directory: bool,
    ) -> Result<(), FsError> {
        let cache = fs.cache();
        let free_map = fs.free_map();
        let mut skeleton = Vec::with_capacity(3);
        while skeleton.len() < 3 {
            match free_map.allocate(1) {
                Some(claimed) => skeleton.push(claimed),
                None => {
                    if !skeleton.is_empty() {
                        free_map.release_many(&skeleton);
                    }
                    warn!("inode: no room for the index of sector {}", sector);
                    return Err(FsError::NoSpace);
                }
            }
        }
        let (double, indirect, data) = (skeleton[0], skeleton[1], skeleton[2]);
        for claimed in skeleton.iter() {
            cache.write(*claimed, 0, &[0u8; SECTOR_SIZE]);
        }
        cache.modify_with(double, 0, |t: &mut IndirectBlock| t[0] = indirect);
        cache.modify_with(indirect, 0, |t: &mut IndirectBlock| t[0] = data);

        let mut disk = DiskInode::new(double, is_directory);
        if let Err(err) = disk.extend(length, cache, free_map) {
            free_map.release_many(&skeleton);
            warn!("inode: create {} bytes at sector {}: {}", length, sector, err);
            return Err(err);
        }
        cache.write(sector, 0, disk.as_bytes());
        debug!("inode: created sector {}, {:?}", sector, disk);
        Ok(())
    }

    /// Open the inode at `sector`, sharing the handle if it is already open.
    ///
    /// Panics if the sector does not hold an inode.
    pub fn open(fs: &Arc<FileSystem>, sector: u32) -> Arc<Self> {
        let mut open = fs.inodes().open.lock();
        if let Some(inode) = open.get(&sector) {
            inode.inner.lock().open_count += 1;
            return inode.clone();
        }
        let disk = fs.cache().read_with(sector, 0, |d: &DiskInode| *d);
        assert!(disk.is_valid(), "sector {} is not an inode", sector);
        let inode = Arc::new(Self {
            sector,
            fs: fs.clone(),
            extension_lock: Mutex::new(()),
            inner: Mutex::new(InodeInner {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk,
            }),
        });
        open.insert(sector, inode.clone());
        inode
    }

    /// Take one more reference to an open inode
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.inner.lock().open_count += 1;
        self.clone()
    }

    /// Drop one reference.
    ///
    /// The last close writes the inode back and forgets the handle; if the
    /// inode was removed, its whole index tree and its own sector go back
    /// to the free map.
    pub fn close(self: Arc<Self>) {
        let cache = self.fs.cache();
        let mut open = self.fs.inodes().open.lock();
        let mut inner = self.inner.lock();
        assert!(inner.open_count > 0, "inode {} closed too often", self.sector);
        inner.open_count -= 1;
        if inner.open_count > 0 {
            return;
        }
        let disk = inner.disk;
        let removed = inner.removed;
        drop(inner);
        cache.write(self.sector, 0, disk.as_bytes());
        open.remove(&self.sector);
        drop(open);

        if removed {
            let mut sectors = disk.index_sectors(cache);
            sectors.push(self.sector);
            debug!("inode: reclaim sector {}, {} sector(s)", self.sector, sectors.len());
            self.fs.free_map().release_many(&sectors);
        }
    }

    /// Sector number of the inode
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// Length in bytes
    pub fn length(&self) -> usize {
        self.inner.lock().disk.length as usize
    }

    /// Whether this inode is a directory
    pub fn is_directory(&self) -> bool {
        self.inner.lock().disk.is_directory()
    }

    /// Mark the inode for deletion once its last opener closes it
    pub fn remove(&self) {
        self.inner.lock().removed = true;
    }

    /// Whether [`Inode::remove`] was called
    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Number of openers
    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }

    /// Number of outstanding write denials
    pub fn deny_write_count(&self) -> usize {
        self.inner.lock().deny_write_count
    }

    /// Reject writes until a matching [`Inode::allow_write`].
    ///
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_count += 1;
        assert!(
            inner.deny_write_count <= inner.open_count,
            "inode {}: more write denials than openers",
            self.sector
        );
    }

    /// Undo one [`Inode::deny_write`]
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.deny_write_count > 0, "inode {}: writes not denied", self.sector);
        assert!(inner.deny_write_count <= inner.open_count);
        inner.deny_write_count -= 1;
    }

    /// Every sector the index tree of this inode occupies
    pub fn index_sectors(&self) -> Vec<u32> {
        let disk = self.inner.lock().disk;
        disk.index_sectors(self.fs.cache())
    }

    /// Read from `offset` into `buf`, stopping at the end of the file.
    /// Returns the number of bytes read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let disk = self.inner.lock().disk;
        let cache = self.fs.cache();
        let end = min(offset.saturating_add(buf.len()), disk.length as usize);
        let mut pos = offset;
        let mut read_size = 0usize;
        while pos < end {
            let sector_offset = pos % SECTOR_SIZE;
            let chunk = min(end - pos, SECTOR_SIZE - sector_offset);
            let sector = match disk.byte_to_sector(pos, cache) {
                Some(sector) => sector,
                None => panic!("inode {}: hole at byte {}", self.sector, pos),
            };
            cache.read(sector, sector_offset, &mut buf[read_size..read_size + chunk]);
            pos += chunk;
            read_size += chunk;
        }
        read_size
    }

    /// Write `buf` at `offset`, growing the file first if it ends past
    /// the current length. Returns the number of bytes written, which is
    /// short if the file could not grow and 0 while writes are denied.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.inner.lock().deny_write_count > 0 {
            return 0;
        }
        let end = offset.saturating_add(buf.len());
        if end > self.length() {
            let _extending = self.extension_lock.lock();
            // someone else may have grown it while we waited
            let mut disk = self.inner.lock().disk;
            let length = disk.length as usize;
            if end > length {
                match disk.extend(end - length, self.fs.cache(), self.fs.free_map()) {
                    Ok(()) => self.inner.lock().disk.length = disk.length,
                    Err(err) => warn!("inode {}: grow to {} bytes: {}", self.sector, end, err),
                }
            }
        }
        self.write_in_place(offset, buf)
    }

    /// Write `buf` at `offset` without growing the file. Returns the number
    /// of bytes written, 0 while writes are denied.
    pub fn write_in_place(&self, offset: usize, buf: &[u8]) -> usize {
        let disk = {
            let inner = self.inner.lock();
            if inner.deny_write_count > 0 {
                return 0;
            }
            inner.disk
        };
        let cache = self.fs.cache();
        let end = min(offset.saturating_add(buf.len()), disk.length as usize);
        let mut pos = offset;
        let mut write_size = 0usize;
        while pos < end {
            let sector_offset = pos % SECTOR_SIZE;
            let chunk = min(end - pos, SECTOR_SIZE - sector_offset);
            let sector = match disk.byte_to_sector(pos, cache) {
                Some(sector) => sector,
                None => panic!("inode {}: hole at byte {}", self.sector, pos),
            };
            cache.write(sector, sector_offset, &buf[write_size..write_size + chunk]);
            pos += chunk;
            write_size += chunk;
        }
        write_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helper::*;
    use std::thread;

    #[test]
    pub fn test_create_empty() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let free = fs.free_map().free_count();
        let sector = fs.create_inode(0, false).unwrap();
        // inode, double-indirect, indirect, first data sector
        assert_eq!(free - fs.free_map().free_count(), 4);
        let inode = fs.open_inode(sector);
        assert_eq!(inode.length(), 0);
        assert!(!inode.is_directory());
        assert_eq!(inode.index_sectors().len(), 3);
        let mut buf = [0u8; 16];
        assert_eq!(inode.read_at(0, &mut buf), 0);
        inode.close();
    }

    #[test]
    pub fn test_ten_thousand_bytes() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let free = fs.free_map().free_count();
        let sector = fs.create_inode(0, false).unwrap();
        let data: Vec<u8> = (0..10_000usize).map(|i| (i * 7 % 251) as u8).collect();
        let inode = fs.open_inode(sector);
        assert_eq!(inode.write_at(0, &data), 10_000);
        assert_eq!(inode.length(), 10_000);
        inode.close();
        assert!(fs.open_inodes().iter().all(|s| *s != sector));

        let inode = fs.open_inode(sector);
        assert_eq!(inode.length(), 10_000);
        let mut buf = vec![0u8; 12_000];
        assert_eq!(inode.read_at(0, &mut buf), 10_000);
        assert_eq!(&buf[..10_000], &data[..]);
        // 20 data sectors, 1 indirect, 1 double-indirect, plus the inode itself
        assert_eq!(free - fs.free_map().free_count(), 20 + 1 + 1 + 1);
        assert_eq!(inode.index_sectors().len(), 22);
        inode.close();
    }

    #[test]
    pub fn test_second_indirect_table() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let free = fs.free_map().free_count();
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        let data: Vec<u8> = (0..70_000usize).map(|i| (i % 256) as u8).collect();
        // grow in uneven pieces
        let mut offset = 0;
        for chunk in data.chunks(3_001) {
            assert_eq!(inode.write_at(offset, chunk), chunk.len());
            offset += chunk.len();
        }
        let mut buf = vec![0u8; 70_000];
        assert_eq!(inode.read_at(0, &mut buf), 70_000);
        assert_eq!(buf, data);
        assert_eq!(inode.index_sectors().len(), 140);
        assert_eq!(free - fs.free_map().free_count(), 141);
        inode.close();
    }

    #[test]
    pub fn test_create_with_length() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let sector = fs.create_inode(1_000, true).unwrap();
        let inode = fs.open_inode(sector);
        assert!(inode.is_directory());
        assert_eq!(inode.length(), 1_000);
        let mut buf = vec![0xffu8; 1_000];
        assert_eq!(inode.read_at(0, &mut buf), 1_000);
        assert!(buf.iter().all(|b| *b == 0));
        inode.close();
    }

    #[test]
    pub fn test_extension_is_atomic() {
        let (_, fs) = test_prepare_fs::<64>(16);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        assert_eq!(inode.write_at(0, &[1u8; 700]), 700);
        let free = fs.free_map().free_count();
        let index = inode.index_sectors();

        let big = vec![2u8; 64 * SECTOR_SIZE];
        // only the bytes inside the current length are written
        assert_eq!(inode.write_at(100, &big), 600);
        assert_eq!(inode.length(), 700);
        assert_eq!(fs.free_map().free_count(), free);
        assert_eq!(inode.index_sectors(), index);
        assert_eq!(inode.write_at(crate::MAX_FILE_SIZE, &[1]), 0);
        assert_eq!(inode.length(), 700);
        assert_eq!(fs.free_map().free_count(), free);
        inode.close();
    }

    #[test]
    pub fn test_create_without_space() {
        let (_, fs) = test_prepare_fs::<64>(16);
        let free = fs.free_map().free_count();
        assert_eq!(fs.create_inode(64 * SECTOR_SIZE, false), Err(FsError::NoSpace));
        assert_eq!(fs.free_map().free_count(), free);
    }

    #[test]
    pub fn test_zero_fill_reused_sectors() {
        let (_, fs) = test_prepare_fs::<256>(8);
        let dirty = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(dirty);
        assert_eq!(inode.write_at(0, &[0xffu8; 6_000]), 6_000);
        inode.remove();
        inode.close();

        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        inode.write_at(0, &[7u8; 10]);
        assert_eq!(inode.write_at(8_000, &[9u8]), 1);
        let mut buf = vec![0xaau8; 8_001];
        assert_eq!(inode.read_at(0, &mut buf), 8_001);
        assert!(buf[..10].iter().all(|b| *b == 7));
        assert!(buf[10..8_000].iter().all(|b| *b == 0));
        assert_eq!(buf[8_000], 9);
        inode.close();
    }

    #[test]
    pub fn test_unlink_while_open() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let free = fs.free_map().free_count();
        let sector = fs.create_inode(0, false).unwrap();
        let first = fs.open_inode(sector);
        let second = fs.open_inode(sector);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.open_count(), 2);
        first.write_at(0, &[3u8; 2_000]);
        let used = fs.free_map().free_count();

        first.remove();
        assert!(second.is_removed());
        first.close();
        assert_eq!(fs.free_map().free_count(), used);
        assert_eq!(second.write_at(2_000, &[4u8; 100]), 100);
        let mut buf = [0u8; 2_100];
        assert_eq!(second.read_at(0, &mut buf), 2_100);
        assert!(buf[..2_000].iter().all(|b| *b == 3));
        assert!(buf[2_000..].iter().all(|b| *b == 4));

        let index = second.index_sectors();
        second.close();
        assert_eq!(fs.free_map().free_count(), free);
        assert!(!fs.free_map().is_allocated(sector));
        assert!(index.iter().all(|s| !fs.free_map().is_allocated(*s)));
        assert!(fs.open_inodes().iter().all(|s| *s != sector));
    }

    #[test]
    pub fn test_reopen_shares_handle() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        let again = inode.reopen();
        assert_eq!(again.open_count(), 2);
        again.write_at(0, &[1u8; 5]);
        assert_eq!(inode.length(), 5);
        again.close();
        assert_eq!(inode.open_count(), 1);
        assert!(fs.open_inodes().contains(&sector));
        inode.close();
        assert!(!fs.open_inodes().contains(&sector));
    }

    #[test]
    pub fn test_deny_write() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        let other = fs.open_inode(sector);
        inode.deny_write();
        other.deny_write();
        assert_eq!(inode.deny_write_count(), 2);
        assert_eq!(inode.write_at(0, &[1u8; 10]), 0);
        assert_eq!(inode.length(), 0);
        inode.allow_write();
        assert_eq!(other.write_at(0, &[1u8; 10]), 0);
        other.allow_write();
        assert_eq!(other.write_at(0, &[1u8; 10]), 10);
        other.close();
        inode.close();
    }

    #[test]
    #[should_panic]
    pub fn test_deny_write_unbalanced() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        inode.deny_write();
        inode.deny_write();
    }

    #[test]
    #[should_panic]
    pub fn test_open_bad_magic() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        fs.open_inode(4000);
    }

    #[test]
    pub fn test_offset_near_usize_max() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        inode.write_at(0, &[3u8; 100]);
        let free = fs.free_map().free_count();
        let mut buf = [0u8; 16];
        assert_eq!(inode.read_at(usize::MAX - 2, &mut buf), 0);
        assert_eq!(inode.write_at(usize::MAX - 2, &[1u8; 16]), 0);
        assert_eq!(inode.write_in_place(usize::MAX - 2, &[1u8; 16]), 0);
        assert_eq!(inode.length(), 100);
        assert_eq!(fs.free_map().free_count(), free);
        inode.close();
    }

    #[test]
    pub fn test_random_ops() {
        let (_, fs) = test_prepare_fs::<4096>(16);
        const LEN: usize = 40_000;
        let sector = fs.create_inode(LEN, false).unwrap();
        let inode = fs.open_inode(sector);
        let mut fake_file = FakeFile::new(LEN);
        for _ in 0..1000 {
            match FileOpGenerator::generate(LEN) {
                FileOp::FileRead { offset, len } => {
                    let mut buf = vec![0u8; len];
                    let mut fake_buf = vec![0u8; len];
                    assert_eq!(inode.read_at(offset, &mut buf), len);
                    fake_file.read_at(offset, &mut fake_buf);
                    assert_eq!(buf, fake_buf);
                }
                FileOp::FileWrite { offset, data } => {
                    assert_eq!(inode.write_at(offset, &data), data.len());
                    fake_file.write_at(offset, &data);
                }
            }
        }
        assert_eq!(inode.length(), LEN);
        inode.close();
    }

    #[test]
    pub fn test_concurrent_extension() {
        let (_, fs) = test_prepare_fs::<4096>(32);
        let sector = fs.create_inode(0, false).unwrap();
        let inode = fs.open_inode(sector);
        let threads: Vec<_> = (0..4usize)
            .map(|id| {
                let inode = inode.reopen();
                thread::spawn(move || {
                    // each thread appends to its own region
                    let base = id * 20_000;
                    for i in 0..20usize {
                        let chunk = [(id * 20 + i) as u8; 1_000];
                        assert_eq!(inode.write_at(base + i * 1_000, &chunk), 1_000);
                    }
                    inode.close();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(inode.length(), 80_000);
        let mut buf = vec![0u8; 80_000];
        assert_eq!(inode.read_at(0, &mut buf), 80_000);
        for id in 0..4usize {
            for i in 0..20usize {
                let start = id * 20_000 + i * 1_000;
                assert!(buf[start..start + 1_000].iter().all(|b| *b == (id * 20 + i) as u8));
            }
        }
        // 157 data sectors, 2 indirect, 1 double-indirect
        assert_eq!(inode.index_sectors().len(), 160);
        assert_eq!(inode.open_count(), 1);
        inode.close();
    }
}
