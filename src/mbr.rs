//! sdfat32 - Master Boot Record
//!
//! Locates partitions in the classic four-entry partition table found in
//! block 0 of most SD cards.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};
use core::fmt::Debug;

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MbrError<E>
where
    E: Debug,
{
    DeviceError(E),
    /// Block 0 doesn't end in 0x55 0xAA
    InvalidMbrSignature,
    /// The status byte is neither 0x00 nor 0x80
    InvalidPartitionStatus(u8),
    /// None of the four entries has a FAT32 type
    NoFat32Partition,
}

impl<E> From<E> for MbrError<E>
where
    E: Debug,
{
    fn from(e: E) -> Self {
        Self::DeviceError(e)
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionNumber {
    One,
    Two,
    Three,
    Four,
}

impl PartitionNumber {
    pub const ALL: [PartitionNumber; 4] = [Self::One, Self::Two, Self::Three, Self::Four];

    /// Partitions are numbered from 1, like `fdisk` does.
    pub fn from_number(number: usize) -> Option<Self> {
        let partition = match number {
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            4 => Self::Four,
            _ => return None,
        };
        Some(partition)
    }

    fn table_offset(self) -> usize {
        let index = match self {
            Self::One => 0,
            Self::Two => 1,
            Self::Three => 2,
            Self::Four => 3,
        };
        Mbr::PARTITION1_START + index * Partition::PARTITION_INFO_LENGTH
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Empty,
    Fat32ChsLba,
    Fat32Lba,
    Fat16Lba,
    Fat16,
    Unknown(u8),
}

impl PartitionType {
    const EMPTY: u8 = 0x00;
    /// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card formatter?)
    /// use.
    const FAT32_CHS_LBA: u8 = 0x0B;
    /// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
    /// partitions.
    const FAT32_LBA: u8 = 0x0C;
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    const FAT16_LBA: u8 = 0x0E;
    /// Marker for a FAT16 partition. Seen on a card formatted with the official
    /// SD-Card formatter.
    const FAT16: u8 = 0x06;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::EMPTY => Self::Empty,
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            Self::FAT16 => Self::Fat16,
            _ => Self::Unknown(value),
        }
    }

    pub fn is_fat32(&self) -> bool {
        matches!(self, Self::Fat32ChsLba | Self::Fat32Lba)
    }
}

/// One entry of the partition table.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub ty: PartitionType,
    pub lba_start: BlockIdx,
    pub block_count: BlockCount,
}

impl Partition {
    const STATUS_IDX: usize = 0;
    const TYPE_IDX: usize = 4;
    const LBA_START_IDX: usize = 8;
    const NUM_BLOCKS_IDX: usize = 12;
    pub(crate) const PARTITION_INFO_LENGTH: usize = 16;

    fn from_info<E>(info: &[u8]) -> Result<Self, MbrError<E>>
    where
        E: Debug,
    {
        let pstatus = info[Self::STATUS_IDX];
        if pstatus != 0x80 && pstatus != 0x00 {
            return Err(MbrError::InvalidPartitionStatus(pstatus));
        }

        let lba_start = read_u32(info, Self::LBA_START_IDX);
        let num_blocks = read_u32(info, Self::NUM_BLOCKS_IDX);

        Ok(Partition {
            ty: PartitionType::from_u8(info[Self::TYPE_IDX]),
            lba_start: BlockIdx(lba_start),
            block_count: BlockCount(num_blocks),
        })
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub struct Mbr;

impl Mbr {
    const FOOTER_START: usize = 510;
    const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;

    fn read_table<BlockDev>(block_dev: &mut BlockDev) -> Result<Block, MbrError<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let block = block_dev.read_block(BlockIdx(0), "read_mbr")?;
        let footer = u16::from_le_bytes([block[Self::FOOTER_START], block[Self::FOOTER_START + 1]]);
        if footer != Self::FOOTER_VALUE {
            return Err(MbrError::InvalidMbrSignature);
        }
        Ok(block)
    }

    /// Read one entry of the partition table.
    pub fn read_partition<BlockDev>(
        block_dev: &mut BlockDev,
        partition_num: PartitionNumber,
    ) -> Result<Partition, MbrError<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let block = Self::read_table(block_dev)?;
        let start = partition_num.table_offset();
        Partition::from_info(&block[start..start + Partition::PARTITION_INFO_LENGTH])
    }

    /// Find the first partition with a FAT32 type byte. Entries with a
    /// bad status byte are skipped.
    pub fn find_fat32<BlockDev>(
        block_dev: &mut BlockDev,
    ) -> Result<Partition, MbrError<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let block = Self::read_table(block_dev)?;
        for number in PartitionNumber::ALL.iter() {
            let start = number.table_offset();
            let info = &block[start..start + Partition::PARTITION_INFO_LENGTH];
            match Partition::from_info::<BlockDev::Error>(info) {
                Ok(partition) if partition.ty.is_fat32() => {
                    debug!(
                        "FAT32 partition {:?} at block {}",
                        number, partition.lba_start.0
                    );
                    return Ok(partition);
                }
                Ok(_) => {}
                Err(_) => warn!("Skipping partition {:?} with bad status", number),
            }
        }
        Err(MbrError::NoFat32Partition)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
