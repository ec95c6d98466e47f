use crate::config::INODE_MAGIC;
use crate::{BufferCache, FreeMap, FsError, SECTOR_SIZE};

use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};
use log::debug;

/// Number of sector pointers in one index sector
pub const INDIRECT_ENTRIES: usize = SECTOR_SIZE / 4;
/// The largest file the double-indirect index can address
pub const MAX_FILE_SIZE: usize = INDIRECT_ENTRIES * INDIRECT_ENTRIES * SECTOR_SIZE;

/// An index sector: pointers to other sectors, 0 for none
pub(crate) type IndirectBlock = [u32; INDIRECT_ENTRIES];

/// The on-disk inode, exactly one sector.
///
/// File data is only ever reached through `double_indirect`: it points to
/// a table of indirect sectors, each a table of data sectors.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    /// File size in bytes
    pub length: u32,
    is_directory: u32,
    /// Sector of the double-indirect table
    pub double_indirect: u32,
    magic: u32,
    unused: [u32; 124],
}

impl Debug for DiskInode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskInode")
            .field("length", &self.length)
            .field("is_directory", &self.is_directory())
            .field("double_indirect", &self.double_indirect)
            .finish()
    }
}

/// Data sectors backing a file of `length` bytes. Even an empty file owns one.
pub fn data_sectors(length: usize) -> usize {
    core::cmp::max(1, (length + SECTOR_SIZE - 1) / SECTOR_SIZE)
}

/// Indirect tables needed to point at the data sectors of `length` bytes.
pub fn indirect_sectors(length: usize) -> usize {
    (data_sectors(length) + INDIRECT_ENTRIES - 1) / INDIRECT_ENTRIES
}

/// Sectors to claim when a file grows from `old_length` to `new_length`.
pub fn sectors_needed(old_length: usize, new_length: usize) -> usize {
    data_sectors(new_length) - data_sectors(old_length) + indirect_sectors(new_length)
        - indirect_sectors(old_length)
}

/// (indirect index, direct index) of the data sector holding `offset`
fn indices_from_offset(offset: usize) -> (usize, usize) {
    let block = offset / SECTOR_SIZE;
    (block / INDIRECT_ENTRIES, block % INDIRECT_ENTRIES)
}

impl DiskInode {
    /// A zero-length inode over an existing double-indirect table
    pub fn new(double_indirect: u32, is_directory: bool) -> Self {
        Self {
            length: 0,
            is_directory: is_directory as u32,
            double_indirect,
            magic: INODE_MAGIC,
            unused: [0; 124],
        }
    }

    /// Check the magic tag
    pub fn is_valid(&self) -> bool {
        self.magic == INODE_MAGIC
    }

    /// Whether this inode is a directory
    pub fn is_directory(&self) -> bool {
        self.is_directory != 0
    }

    /// The raw sector image
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: DiskInode is repr(C), made of u32s and exactly one sector long.
        unsafe { core::slice::from_raw_parts(self as *const _ as usize as *const u8, SECTOR_SIZE) }
    }

    /// The data sector holding byte `offset`, or `None` for a hole.
    pub fn byte_to_sector(&self, offset: usize, cache: &BufferCache) -> Option<u32> {
        let (indirect_idx, direct_idx) = indices_from_offset(offset);
        if indirect_idx >= INDIRECT_ENTRIES {
            return None;
        }
        let indirect = cache.read_with(self.double_indirect, indirect_idx * 4, |p: &u32| *p);
        if indirect == 0 {
            return None;
        }
        match cache.read_with(indirect, direct_idx * 4, |p: &u32| *p) {
            0 => None,
            sector => Some(sector),
        }
    }

    /// Grow the file by `additional` bytes of zeroes.
    ///
    /// Every sector is claimed before anything is written, so a failure
    /// leaves the index and the free map as they were. The new length is
    /// set last.
    pub fn extend(
        &mut self,
        additional: usize,
        cache: &BufferCache,
        free_map: &FreeMap,
    ) -> Result<(), FsError> {
        let old_length = self.length as usize;
        let new_length = match old_length.checked_add(additional) {
            Some(len) if len <= MAX_FILE_SIZE => len,
            _ => return Err(FsError::FileTooLarge),
        };
        let needed = sectors_needed(old_length, new_length);
        if needed == 0 {
            self.length = new_length as u32;
            return Ok(());
        }
        let fresh = free_map.allocate_scattered(needed)?;
        let (new_tables, new_data) =
            fresh.split_at(indirect_sectors(new_length) - indirect_sectors(old_length));
        debug!(
            "inode: extend {} -> {} bytes, {} table(s) {} data sector(s)",
            old_length,
            new_length,
            new_tables.len(),
            new_data.len()
        );

        let mut double: IndirectBlock = cache.read_with(self.double_indirect, 0, |t: &IndirectBlock| *t);
        let first_block = data_sectors(old_length);
        let mut indirect_idx = (first_block - 1) / INDIRECT_ENTRIES;
        let mut table: IndirectBlock = cache.read_with(double[indirect_idx], 0, |t: &IndirectBlock| *t);
        let mut tables_used = 0;
        for (block, sector) in (first_block..data_sectors(new_length)).zip(new_data.iter()) {
            let (i, d) = (block / INDIRECT_ENTRIES, block % INDIRECT_ENTRIES);
            if i != indirect_idx {
                // current table is full: flush it and chain a fresh one
                cache.modify_with(double[indirect_idx], 0, |t: &mut IndirectBlock| *t = table);
                indirect_idx = i;
                double[i] = new_tables[tables_used];
                tables_used += 1;
                table = [0; INDIRECT_ENTRIES];
            }
            cache.write(*sector, 0, &[0u8; SECTOR_SIZE]);
            table[d] = *sector;
        }
        assert_eq!(tables_used, new_tables.len());
        cache.modify_with(double[indirect_idx], 0, |t: &mut IndirectBlock| *t = table);
        cache.modify_with(self.double_indirect, 0, |t: &mut IndirectBlock| *t = double);

        self.length = new_length as u32;
        Ok(())
    }

    /// Every sector of the index tree: data sectors, indirect tables and the
    /// double-indirect table, in that order.
    pub fn index_sectors(&self, cache: &BufferCache) -> Vec<u32> {
        let double: IndirectBlock = cache.read_with(self.double_indirect, 0, |t: &IndirectBlock| *t);
        let mut sectors = Vec::new();
        let mut tables = Vec::new();
        for indirect in double.iter().copied().filter(|s| *s != 0) {
            let table: IndirectBlock = cache.read_with(indirect, 0, |t: &IndirectBlock| *t);
            sectors.extend(table.iter().copied().filter(|s| *s != 0));
            tables.push(indirect);
        }
        sectors.extend(tables);
        sectors.push(self.double_indirect);
        sectors
    }
}
