use core::cell::RefCell;

use super::{Block, BlockCount, BlockDevice, BlockIdx};

impl<T> BlockDevice for RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error> {
        self.get_mut().read_block(block_idx, reason)
    }

    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        self.get_mut().write_block(block_idx, block)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.get_mut().num_blocks()
    }
}

/// Lets several owners (say, two volumes on one card) share a device. Each
/// call borrows the device for exactly one block transfer.
impl<T> BlockDevice for &RefCell<T>
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.read_block(block_idx, reason)
    }

    fn write_block(&mut self, block_idx: BlockIdx, block: &Block) -> Result<(), Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.write_block(block_idx, block)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let mut underlying = self.borrow_mut();
        underlying.num_blocks()
    }
}
