use core::any::Any;

/// Trait for block devices, which reads and writes data in the unit of sectors.
///
/// Both calls are synchronous and assumed to always succeed.
pub trait BlockDevice: Send + Sync + Any {
    /// Read a sector into `buf`, which holds exactly one sector
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write `buf`, which holds exactly one sector, to a sector
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
