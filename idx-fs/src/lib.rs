#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

//! Sector-indexed file storage: a shared buffer cache, a bitmap free map
//! and inodes addressed through a two-level (double-indirect) index.

extern crate alloc;

mod bitmap;
mod block_dev;
mod buffer_cache;
pub mod config;
mod error;
mod free_map;
mod fs;
mod inode;
mod layout;
#[cfg(test)]
mod test_helper;

pub use bitmap::Bitmap;
pub use block_dev::BlockDevice;
pub use buffer_cache::{BufferCache, LockMode, SlotState};
pub use config::{FsConfig, SECTOR_SIZE};
pub use error::FsError;
pub use free_map::FreeMap;
pub use fs::FileSystem;
pub use inode::Inode;
pub use layout::{DiskInode, INDIRECT_ENTRIES, MAX_FILE_SIZE};
