use alloc::vec;
use alloc::vec::Vec;

/// Bits per group
const GROUP_BITS: usize = 64;

/// An in-memory bitmap of fixed length, packed into u64 groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    groups: Vec<u64>,
    bits: usize,
}

/// Decompose a bit into (bits64_pos, inner_pos)
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / GROUP_BITS, bit % GROUP_BITS)
}

impl Bitmap {
    /// A bitmap of `bits` bits, all clear
    pub fn new(bits: usize) -> Self {
        Self {
            groups: vec![0u64; (bits + GROUP_BITS - 1) / GROUP_BITS],
            bits,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Whether the bitmap has no bits at all
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Size in bytes of the serialized bitmap
    pub fn file_size(&self) -> usize {
        (self.bits + 7) / 8
    }

    /// Value of one bit
    pub fn test(&self, bit: usize) -> bool {
        assert!(bit < self.bits);
        let (bits64_pos, inner_pos) = decomposition(bit);
        self.groups[bits64_pos] & (1u64 << inner_pos) != 0
    }

    /// Set one bit
    pub fn mark(&mut self, bit: usize) {
        self.set(bit, true);
    }

    /// Clear one bit
    pub fn reset(&mut self, bit: usize) {
        self.set(bit, false);
    }

    /// Set one bit to `value`
    pub fn set(&mut self, bit: usize, value: bool) {
        assert!(bit < self.bits);
        let (bits64_pos, inner_pos) = decomposition(bit);
        if value {
            self.groups[bits64_pos] |= 1u64 << inner_pos;
        } else {
            self.groups[bits64_pos] &= !(1u64 << inner_pos);
        }
    }

    /// Set `cnt` bits starting at `start` to `value`
    pub fn set_multiple(&mut self, start: usize, cnt: usize, value: bool) {
        for bit in start..start + cnt {
            self.set(bit, value);
        }
    }

    /// Number of bits in `[start, start + cnt)` equal to `value`
    pub fn count(&self, start: usize, cnt: usize, value: bool) -> usize {
        assert!(start + cnt <= self.bits);
        (start..start + cnt).filter(|bit| self.test(*bit) == value).count()
    }

    /// Whether every bit in `[start, start + cnt)` is set
    pub fn all(&self, start: usize, cnt: usize) -> bool {
        self.count(start, cnt, true) == cnt
    }

    /// Find the first run of `cnt` bits equal to `value`, at or after `start`
    pub fn scan(&self, start: usize, cnt: usize, value: bool) -> Option<usize> {
        if cnt == 0 || cnt > self.bits {
            return None;
        }
        let mut run = 0usize;
        for bit in start..self.bits {
            if self.test(bit) == value {
                run += 1;
                if run == cnt {
                    return Some(bit + 1 - cnt);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Find the first run of `cnt` bits equal to `value` and flip them
    pub fn scan_and_flip(&mut self, start: usize, cnt: usize, value: bool) -> Option<usize> {
        let first = self.scan(start, cnt, value)?;
        self.set_multiple(first, cnt, !value);
        Some(first)
    }

    /// Serialize into `buf` (little-endian groups), which holds `file_size()` bytes
    pub fn write_bytes(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), self.file_size());
        for (chunk, group) in buf.chunks_mut(8).zip(self.groups.iter()) {
            chunk.copy_from_slice(&group.to_le_bytes()[..chunk.len()]);
        }
    }

    /// Load from `buf` as produced by [`Bitmap::write_bytes`]
    pub fn read_bytes(&mut self, buf: &[u8]) {
        assert_eq!(buf.len(), self.file_size());
        for (chunk, group) in buf.chunks(8).zip(self.groups.iter_mut()) {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *group = u64::from_le_bytes(bytes);
        }
    }
}
