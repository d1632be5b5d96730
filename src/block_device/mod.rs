//! sdfat32 - Block Device support
//!
//! Generic code for handling block devices.

#[cfg(feature = "refcell-blockdevice")]
mod refcell;

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
///
/// Every call transfers exactly one whole block; there is no sub-block
/// addressing.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read the block at the given index. `reason` is only used for tracing.
    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error>;
    /// Write one block at the given index.
    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error> {
        (*self).read_block(block_idx, reason)
    }

    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        (*self).write_block(block_idx, block)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// The errors a [`MemoryBlockDevice`] can return.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The block lies (partly) outside the backing memory.
    OutOfRange(BlockIdx),
}

/// A block device backed by a byte slice, e.g. a disk image loaded into RAM.
///
/// Trailing bytes that do not form a whole block are ignored.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    /// Wrap the given memory.
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    /// Give the memory back.
    pub fn release(self) -> &'a mut [u8] {
        self.memory
    }

    fn block_range(&self, block_idx: BlockIdx) -> Result<core::ops::Range<usize>, MemoryError> {
        let start = (block_idx.0 as usize)
            .checked_mul(Block::LEN)
            .ok_or(MemoryError::OutOfRange(block_idx))?;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            return Err(MemoryError::OutOfRange(block_idx));
        }
        Ok(start..end)
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read_block(&mut self, block_idx: BlockIdx, _reason: &str) -> Result<Block, Self::Error> {
        let range = self.block_range(block_idx)?;
        let mut block = Block::new();
        block.contents.copy_from_slice(&self.memory[range]);
        Ok(block)
    }

    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        let range = self.block_range(block_idx)?;
        self.memory[range].copy_from_slice(&block.contents);
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}
