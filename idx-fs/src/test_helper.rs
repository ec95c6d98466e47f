pub use crate::config::FsConfig;
pub use crate::{BlockDevice, FileSystem, SECTOR_SIZE};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An in-memory disk of `N` sectors.
pub struct TestBlockDevice<const N: usize> {
    pub blocks: Box<Mutex<Vec<[u8; SECTOR_SIZE]>>>,
}

impl<const N: usize> TestBlockDevice<N> {
    pub fn new() -> Self {
        Self {
            blocks: Box::new(Mutex::new(vec![[0u8; SECTOR_SIZE]; N])),
        }
    }

    /// Fill every sector with `byte`, to catch reads of never-written data.
    pub fn filled(byte: u8) -> Self {
        Self {
            blocks: Box::new(Mutex::new(vec![[byte; SECTOR_SIZE]; N])),
        }
    }

    pub fn sector(&self, block_id: usize) -> [u8; SECTOR_SIZE] {
        self.blocks.lock().unwrap()[block_id]
    }
}

impl<const N: usize> BlockDevice for TestBlockDevice<N> {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        assert!(block_id < N);
        let blocks = self.blocks.as_ref().lock().unwrap();
        buf.copy_from_slice(&blocks[block_id]);
    }
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        assert!(block_id < N);
        let mut blocks = self.blocks.as_ref().lock().unwrap();
        blocks[block_id].copy_from_slice(buf);
    }
}

/// Wraps a device and counts the sector transfers going through it.
pub struct CountingBlockDevice<const N: usize> {
    pub inner: TestBlockDevice<N>,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

impl<const N: usize> CountingBlockDevice<N> {
    pub fn new() -> Self {
        Self {
            inner: TestBlockDevice::new(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl<const N: usize> BlockDevice for CountingBlockDevice<N> {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_block(block_id, buf);
    }
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_block(block_id, buf);
    }
}

/// Format a fresh in-memory filesystem of `N` sectors.
pub fn test_prepare_fs<const N: usize>(cache_slots: usize) -> (Arc<TestBlockDevice<N>>, Arc<FileSystem>) {
    let block_dev = Arc::new(TestBlockDevice::<N>::new());
    let config = FsConfig::new(N as u32).with_cache_slots(cache_slots);
    let fs = FileSystem::format(block_dev.clone(), config);
    (block_dev, fs)
}

pub struct FakeFile {
    v: Vec<u8>,
}

impl FakeFile {
    pub fn new(size: usize) -> Self {
        Self { v: vec![0u8; size] }
    }
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.v.as_slice()[offset..offset + dst.len()]);
    }
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        let dst = &mut self.v.as_mut_slice()[offset..offset + src.len()];
        dst.copy_from_slice(src);
    }
}

pub struct FileOpGenerator;

#[derive(Debug)]
pub enum FileOp {
    FileRead { offset: usize, len: usize },
    FileWrite { offset: usize, data: Vec<u8> },
}

impl FileOpGenerator {
    /// A random read or write of at least one byte inside a file of `file_len` bytes.
    pub fn generate(file_len: usize) -> FileOp {
        assert!(file_len >= 2, "file of {} bytes is too short for random ops", file_len);
        let mut rng = rand::thread_rng();
        let offset = rng.gen_range(0..file_len - 1);
        let len = rng.gen_range(1..file_len - offset);
        if rng.gen() {
            FileOp::FileRead { offset, len }
        } else {
            let data: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
            FileOp::FileWrite { offset, data }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_generate_two_byte_file() {
        for _ in 0..200 {
            let (offset, len) = match FileOpGenerator::generate(2) {
                FileOp::FileRead { offset, len } => (offset, len),
                FileOp::FileWrite { offset, data } => (offset, data.len()),
            };
            assert!(len >= 1);
            assert!(offset + len <= 2);
        }
    }

    #[test]
    #[should_panic]
    pub fn test_generate_one_byte_file() {
        FileOpGenerator::generate(1);
    }
}
