use crate::{BlockDevice, SECTOR_SIZE};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use log::trace;
use spin::{Mutex, MutexGuard};

#[derive(Copy, Clone)]
#[repr(align(512))]
struct SectorBuf([u8; SECTOR_SIZE]);

impl Default for SectorBuf {
    fn default() -> Self {
        Self([0u8; SECTOR_SIZE])
    }
}
impl Deref for SectorBuf {
    type Target = [u8; SECTOR_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl DerefMut for SectorBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl SectorBuf {
    fn check_value_validity<T>(&self, offset: usize) {
        let start_addr = &self.0[offset] as *const _ as usize;
        // We guarantee that the input arguments are correct. Thus,
        // if we find that the arguments are not valid, just panic.
        assert_eq!(start_addr % core::mem::align_of::<T>(), 0);
        assert!(offset + core::mem::size_of::<T>() <= SECTOR_SIZE);
    }

    fn value_ref_at_offset<T>(&self, offset: usize) -> &T {
        self.check_value_validity::<T>(offset);
        // Safety: the address is aligned to T and the value lies inside the sector.
        unsafe { &*(&self.0[offset] as *const u8 as *const T) }
    }

    fn value_mut_at_offset<T>(&mut self, offset: usize) -> &mut T {
        self.check_value_validity::<T>(offset);
        // Safety: See value_ref_at_offset.
        unsafe { &mut *(&mut self.0[offset] as *mut u8 as *mut T) }
    }
}

/// Logical lock state of a cache slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Nobody holds or has been granted the slot
    Unlocked,
    /// One or more readers have been admitted
    ReadLocked,
    /// A single writer has been admitted
    WriteLocked,
}

/// Snapshot of a slot's bookkeeping, for inspection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotState {
    /// The sector held by the slot
    pub sector: Option<u32>,
    /// Whether the cached data differs from the device
    pub dirty: bool,
    /// Whether the slot was touched since it was last bound
    pub accessed: bool,
    /// Current lock mode
    pub mode: LockMode,
    /// Readers admitted and not yet finished
    pub readers_active: usize,
    /// Readers waiting for admission
    pub readers_waiting: usize,
    /// Writers waiting for admission
    pub writers_waiting: usize,
}

/// Bookkeeping of one slot, guarded by the slot lock.
struct SlotMeta {
    sector: Option<u32>,
    dirty: bool,
    accessed: bool,
    mode: LockMode,
    readers_active: usize,
    readers_waiting: usize,
    writers_waiting: usize,
    /// Bumped each time a releasing writer admits the waiting readers.
    reader_epoch: usize,
    /// Admissions handed to waiting writers and not yet taken.
    writer_grants: usize,
}

impl SlotMeta {
    fn empty() -> Self {
        Self {
            sector: None,
            dirty: false,
            accessed: false,
            mode: LockMode::Unlocked,
            readers_active: 0,
            readers_waiting: 0,
            writers_waiting: 0,
            reader_epoch: 0,
            writer_grants: 0,
        }
    }

    /// Someone holds, was granted or waits for this slot.
    fn is_busy(&self) -> bool {
        self.mode != LockMode::Unlocked
            || self.readers_waiting > 0
            || self.writers_waiting > 0
            || self.writer_grants > 0
    }

    fn state(&self) -> SlotState {
        SlotState {
            sector: self.sector,
            dirty: self.dirty,
            accessed: self.accessed,
            mode: self.mode,
            readers_active: self.readers_active,
            readers_waiting: self.readers_waiting,
            writers_waiting: self.writers_waiting,
        }
    }
}

/// One slot of the cache, holding a copy of one sector.
///
/// `data` is only touched by admitted readers (shared), by an admitted
/// writer (exclusive), or by the holder of `meta` while the slot is idle,
/// which is how it gets loaded and written back.
struct CacheSlot {
    meta: Mutex<SlotMeta>,
    data: UnsafeCell<SectorBuf>,
}

// Safety: access to `data` follows the admission protocol above.
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            meta: Mutex::new(SlotMeta::empty()),
            data: UnsafeCell::new(SectorBuf::default()),
        }
    }

    /// Safety: the caller is an admitted reader, or holds `meta` with the slot idle.
    unsafe fn data(&self) -> &SectorBuf {
        &*self.data.get()
    }

    /// Safety: the caller is the admitted writer, or holds `meta` with the slot idle.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut(&self) -> &mut SectorBuf {
        &mut *self.data.get()
    }
}

/// Sector to slot bindings, guarded by the directory lock.
struct Directory {
    sectors: Vec<Option<u32>>,
    /// Round-robin eviction cursor.
    clock_hand: usize,
}

impl Directory {
    fn lookup(&self, sector: u32) -> Option<usize> {
        self.sectors.iter().position(|s| *s == Some(sector))
    }

    fn empty_slot(&self) -> Option<usize> {
        self.sectors.iter().position(|s| s.is_none())
    }

    fn next_victim(&mut self) -> usize {
        let victim = self.clock_hand;
        self.clock_hand = (self.clock_hand + 1) % self.sectors.len();
        victim
    }
}

/// A fixed pool of sector copies shared by all threads.
///
/// A sector is bound to at most one slot at any time. Lookups go through
/// the directory lock, which is never held across device I/O. Each slot
/// has its own lock, held for its bookkeeping and while the slot is
/// loaded or written back. Bytes are copied outside that lock, under a
/// read or write admission: readers share a slot unless a writer is
/// queued, a queued writer goes before newly arriving readers, and a
/// finishing writer admits every waiting reader at once.
///
/// The closures given to [`BufferCache::read_with`] and
/// [`BufferCache::modify_with`] run under such an admission and must not
/// write the sector they were given.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    directory: Mutex<Directory>,
    slots: Vec<CacheSlot>,
}

impl BufferCache {
    /// Create a cache of `capacity` empty slots in front of `device`.
    pub fn new(device: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer cache needs at least one slot");
        Self {
            device,
            directory: Mutex::new(Directory {
                sectors: alloc::vec![None; capacity],
                clock_hand: 0,
            }),
            slots: (0..capacity).map(|_| CacheSlot::empty()).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The sector bound to each slot, as seen by the directory.
    pub fn resident_sectors(&self) -> Vec<Option<u32>> {
        self.directory.lock().sectors.clone()
    }

    /// Bookkeeping of one slot.
    pub fn slot_state(&self, slot_id: usize) -> SlotState {
        self.slots[slot_id].meta.lock().state()
    }

    /// Copy `buf.len()` bytes of `sector`, starting at `offset`, into `buf`.
    pub fn read(&self, sector: u32, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        self.read_slot(sector, |data| {
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
        });
    }

    /// Copy `buf` into `sector` at `offset`.
    ///
    /// A write covering the whole sector does not load it from the device first.
    pub fn write(&self, sector: u32, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        let overwrite = offset == 0 && buf.len() == SECTOR_SIZE;
        self.write_slot(sector, overwrite, |data| {
            data[offset..offset + buf.len()].copy_from_slice(buf);
        });
    }

    /// Apply a read operation on a value of type T at `offset` of `sector`.
    pub fn read_with<T, V>(&self, sector: u32, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        self.read_slot(sector, |data| f(data.value_ref_at_offset::<T>(offset)))
    }

    /// Apply a write operation on a value of type T at `offset` of `sector`.
    pub fn modify_with<T, V>(&self, sector: u32, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        self.write_slot(sector, false, |data| f(data.value_mut_at_offset::<T>(offset)))
    }

    /// Bring `sector` into the cache without copying it out.
    pub fn prefetch(&self, sector: u32) {
        let (_, meta) = self.resolve(sector, false);
        drop(meta);
    }

    /// Write every dirty slot back to the device.
    ///
    /// Each dirty slot is written back as a reader, so a writer in progress
    /// finishes first.
    pub fn flush_all(&self) {
        let bound: Vec<(usize, u32)> = self
            .directory
            .lock()
            .sectors
            .iter()
            .enumerate()
            .filter_map(|(slot_id, sector)| sector.map(|s| (slot_id, s)))
            .collect();
        for (slot_id, sector) in bound {
            let meta = self.slots[slot_id].meta.lock();
            if meta.sector != Some(sector) || !meta.dirty {
                continue;
            }
            let mut meta = self.admit_reader(slot_id, sector, meta);
            if meta.dirty {
                trace!("bcache: write back sector {}", sector);
                // Safety: admitted as a reader.
                let data = unsafe { self.slots[slot_id].data() };
                self.device.write_block(sector as usize, &data[..]);
                meta.dirty = false;
            }
            Self::release_reader(&mut meta);
        }
    }

    /// Reader side of the admission protocol.
    fn read_slot<V>(&self, sector: u32, f: impl FnOnce(&SectorBuf) -> V) -> V {
        let (slot_id, meta) = self.resolve(sector, false);
        let meta = self.admit_reader(slot_id, sector, meta);
        drop(meta);

        // Safety: admitted as a reader; the slot can't be rebound until we leave.
        let ret = f(unsafe { self.slots[slot_id].data() });

        let mut meta = self.slots[slot_id].meta.lock();
        meta.accessed = true;
        Self::release_reader(&mut meta);
        ret
    }

    /// Writer side of the admission protocol.
    fn write_slot<V>(&self, sector: u32, overwrite: bool, f: impl FnOnce(&mut SectorBuf) -> V) -> V {
        let (slot_id, meta) = self.resolve(sector, overwrite);
        let meta = self.admit_writer(slot_id, sector, meta);
        drop(meta);

        // Safety: admitted as the only writer; no reader is active.
        let ret = f(unsafe { self.slots[slot_id].data_mut() });

        let mut meta = self.slots[slot_id].meta.lock();
        meta.accessed = true;
        meta.dirty = true;
        Self::release_writer(&mut meta);
        ret
    }

    /// Admit a reader on a slot bound to `sector`, waiting if a writer
    /// holds it or is queued for it.
    fn admit_reader<'a>(
        &'a self,
        slot_id: usize,
        sector: u32,
        mut meta: MutexGuard<'a, SlotMeta>,
    ) -> MutexGuard<'a, SlotMeta> {
        match meta.mode {
            LockMode::Unlocked => {
                meta.mode = LockMode::ReadLocked;
                meta.readers_active += 1;
            }
            LockMode::ReadLocked if meta.writers_waiting == 0 => {
                meta.readers_active += 1;
            }
            _ => {
                // A releasing writer admits us and counts us as active.
                meta.readers_waiting += 1;
                let epoch = meta.reader_epoch;
                drop(meta);
                meta = self.wait_on(slot_id, |m| m.reader_epoch != epoch);
                assert_eq!(meta.sector, Some(sector), "slot rebound under a waiting reader");
            }
        }
        assert_eq!(meta.mode, LockMode::ReadLocked);
        meta
    }

    fn release_reader(meta: &mut SlotMeta) {
        assert_eq!(meta.mode, LockMode::ReadLocked);
        meta.readers_active -= 1;
        if meta.readers_active == 0 {
            if meta.writers_waiting > 0 {
                meta.mode = LockMode::WriteLocked;
                meta.writers_waiting -= 1;
                meta.writer_grants += 1;
            } else {
                meta.mode = LockMode::Unlocked;
            }
        }
    }

    /// Admit the single writer on a slot bound to `sector`, waiting while
    /// anyone else holds it.
    fn admit_writer<'a>(
        &'a self,
        slot_id: usize,
        sector: u32,
        mut meta: MutexGuard<'a, SlotMeta>,
    ) -> MutexGuard<'a, SlotMeta> {
        if meta.mode == LockMode::Unlocked {
            meta.mode = LockMode::WriteLocked;
        } else {
            meta.writers_waiting += 1;
            drop(meta);
            meta = self.wait_on(slot_id, |m| m.writer_grants > 0);
            meta.writer_grants -= 1;
            assert_eq!(meta.sector, Some(sector), "slot rebound under a waiting writer");
        }
        assert_eq!(meta.mode, LockMode::WriteLocked);
        assert_eq!(meta.readers_active, 0, "writer admitted with active readers");
        meta
    }

    fn release_writer(meta: &mut SlotMeta) {
        assert_eq!(meta.mode, LockMode::WriteLocked);
        if meta.readers_waiting > 0 {
            // Hand the slot to every waiting reader at once.
            meta.mode = LockMode::ReadLocked;
            meta.readers_active += meta.readers_waiting;
            meta.readers_waiting = 0;
            meta.reader_epoch = meta.reader_epoch.wrapping_add(1);
        } else if meta.writers_waiting > 0 {
            meta.writers_waiting -= 1;
            meta.writer_grants += 1;
        } else {
            meta.mode = LockMode::Unlocked;
        }
    }

    /// Spin until `ready` holds for the slot, returning with the slot locked.
    fn wait_on(&self, slot_id: usize, ready: impl Fn(&SlotMeta) -> bool) -> MutexGuard<'_, SlotMeta> {
        loop {
            core::hint::spin_loop();
            let meta = self.slots[slot_id].meta.lock();
            if ready(&*meta) {
                return meta;
            }
        }
    }

    /// Find the slot holding `sector`, loading it on a miss, and return it locked.
    ///
    /// The directory lookup and the slot lock are not taken atomically, so the
    /// binding is checked again once the slot is locked and the lookup is
    /// retried if the slot was rebound in the meantime.
    fn resolve(&self, sector: u32, overwrite: bool) -> (usize, MutexGuard<'_, SlotMeta>) {
        loop {
            let found = self.directory.lock().lookup(sector);
            let candidate = match found {
                Some(slot_id) => Some((slot_id, self.slots[slot_id].meta.lock())),
                None => self.get_free_slot(sector, overwrite),
            };
            if let Some((slot_id, meta)) = candidate {
                if meta.sector == Some(sector) {
                    return (slot_id, meta);
                }
            }
        }
    }

    /// Bind `sector` to an empty slot, or evict one. Returns with the slot
    /// locked and the directory lock released, or `None` if the caller
    /// has to retry.
    fn get_free_slot(&self, sector: u32, overwrite: bool) -> Option<(usize, MutexGuard<'_, SlotMeta>)> {
        let mut directory = self.directory.lock();
        if let Some(slot_id) = directory.lookup(sector) {
            drop(directory);
            return Some((slot_id, self.slots[slot_id].meta.lock()));
        }
        if let Some(slot_id) = directory.empty_slot() {
            // Only inspection takes an unbound slot's lock, and never
            // while waiting for the directory.
            let mut meta = self.slots[slot_id].meta.lock();
            assert!(!meta.is_busy(), "unbound cache slot {} in use", slot_id);
            directory.sectors[slot_id] = Some(sector);
            meta.sector = Some(sector);
            drop(directory);
            trace!("bcache: sector {} -> empty slot {}", sector, slot_id);
            if !overwrite {
                // Safety: the slot is idle and we hold its lock.
                let data = unsafe { self.slots[slot_id].data_mut() };
                self.device.read_block(sector as usize, &mut data[..]);
            }
            return Some((slot_id, meta));
        }
        let victim = directory.next_victim();
        drop(directory);
        self.evict(victim, sector, overwrite)
    }

    fn evict(&self, victim: usize, sector: u32, overwrite: bool) -> Option<(usize, MutexGuard<'_, SlotMeta>)> {
        let mut meta = self.slots[victim].meta.lock();
        if meta.is_busy() {
            return None;
        }
        // Still bound to the old sector: a concurrent miss on it blocks on
        // this slot instead of reading the device before the write-back.
        if meta.dirty {
            if let Some(old) = meta.sector {
                trace!("bcache: write back sector {} from slot {}", old, victim);
                // Safety: the slot is idle and we hold its lock.
                let data = unsafe { self.slots[victim].data() };
                self.device.write_block(old as usize, &data[..]);
            }
            meta.dirty = false;
        }

        let mut directory = self.directory.lock();
        if let Some(slot_id) = directory.lookup(sector) {
            // Someone loaded it while we waited for the victim.
            drop(directory);
            drop(meta);
            return Some((slot_id, self.slots[slot_id].meta.lock()));
        }
        let old = meta.sector;
        directory.sectors[victim] = Some(sector);
        meta.sector = Some(sector);
        drop(directory);

        trace!("bcache: evict sector {:?} from slot {} for sector {}", old, victim, sector);
        meta.accessed = false;
        if !overwrite {
            // Safety: see above.
            let data = unsafe { self.slots[victim].data_mut() };
            self.device.read_block(sector as usize, &mut data[..]);
        }
        Some((victim, meta))
    }
}
