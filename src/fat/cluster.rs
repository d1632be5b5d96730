use crate::{BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

/// A cluster number. Data clusters start at 2.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cluster(pub u32);

impl Cluster {
    /// The first cluster of the data area.
    pub const FIRST_DATA: Cluster = Cluster(2);

    pub fn new(cluster_number: u32) -> Self {
        Self(cluster_number)
    }
}

/// What a FAT entry says about the cluster it belongs to.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Free,
    /// In use, the entry holds the next cluster of the chain.
    Allocated,
    Bad,
    EndOfFile,
    /// Clusters 0/1, or a value that doesn't name a data cluster.
    Reserved,
    /// The FAT sector couldn't be read.
    ReadError,
}

/// One 32 bit FAT entry with the top four bits dropped.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry(u32);

impl Entry {
    const MASK: u32 = 0x0FFF_FFFF;

    pub const FREE: Self = Self(0);
    pub const BAD: Self = Self(0x0FFF_FFF7);
    pub const FINAL: Self = Self(0x0FFF_FFFF);
    const EOF_RANGE_START: u32 = 0x0FFF_FFF8;

    pub fn new(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Classify the entry. Values naming a cluster past `max_cluster` are
    /// treated as reserved, never followed.
    pub fn state(&self, max_cluster: u32) -> ClusterState {
        match self.0 {
            0 => ClusterState::Free,
            1 => ClusterState::Reserved,
            v if v == Self::BAD.0 => ClusterState::Bad,
            v if v >= Self::EOF_RANGE_START => ClusterState::EndOfFile,
            v if v > max_cluster => ClusterState::Reserved,
            _ => ClusterState::Allocated,
        }
    }
}

/// Maps data clusters to absolute sectors.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataArea {
    first_sector: BlockIdx,
    sectors_per_cluster: BlockCount,
}

impl DataArea {
    pub fn new(first_sector: BlockIdx, sectors_per_cluster: BlockCount) -> Self {
        Self {
            first_sector,
            sectors_per_cluster,
        }
    }

    pub fn first_sector(&self) -> BlockIdx {
        self.first_sector
    }

    pub fn sectors_per_cluster(&self) -> BlockCount {
        self.sectors_per_cluster
    }

    pub fn first_sector_of_cluster(&self, cluster: Cluster) -> BlockIdx {
        let offset = cluster.0.saturating_sub(2) * self.sectors_per_cluster.0;
        self.first_sector + BlockCount(offset)
    }
}

/// Follows cluster chains through the active FAT, one FAT sector per call.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatWalker {
    fat_start: BlockIdx,
    entries_per_sector: u32,
    max_cluster: u32,
}

impl FatWalker {
    /// `fat_start` is the absolute first sector of the FAT copy to read.
    /// `max_cluster` is the highest cluster number both the data area and
    /// the FAT can hold.
    pub fn new(fat_start: BlockIdx, entries_per_sector: u32, max_cluster: u32) -> Self {
        Self {
            fat_start,
            entries_per_sector,
            max_cluster,
        }
    }

    pub fn fat_start(&self) -> BlockIdx {
        self.fat_start
    }

    pub fn entries_per_sector(&self) -> u32 {
        self.entries_per_sector
    }

    pub fn max_cluster(&self) -> u32 {
        self.max_cluster
    }

    /// Is this a data cluster of the volume?
    pub fn is_valid(&self, cluster: Cluster) -> bool {
        cluster.0 >= 2 && cluster.0 <= self.max_cluster
    }

    /// Collect the clusters following `cluster` into `out`.
    ///
    /// Returns the state that stopped the walk and how many clusters were
    /// stored. `Allocated` means the chain goes on: either `out` is full or
    /// the next entry lives in another FAT sector, and the walk continues
    /// from the last stored cluster. Reads at most one sector per call.
    pub fn read_next<BD>(
        &self,
        block_device: &mut BD,
        cluster: Cluster,
        out: &mut [Cluster],
    ) -> (ClusterState, usize)
    where
        BD: BlockDevice,
    {
        if out.is_empty() {
            return (ClusterState::Allocated, 0);
        }
        if !self.is_valid(cluster) {
            return (ClusterState::Reserved, 0);
        }

        let fat_sector = cluster.0 / self.entries_per_sector;
        let sector_idx = self.fat_start + BlockCount(fat_sector);
        let block = match block_device.read_block(sector_idx, "read_fat") {
            Ok(block) => block,
            Err(_) => {
                warn!("Reading FAT sector {} failed", sector_idx.0);
                return (ClusterState::ReadError, 0);
            }
        };

        let mut index = (cluster.0 % self.entries_per_sector) as usize;
        let mut filled = 0;
        loop {
            let offset = index * 4;
            let entry = Entry::new(u32::from_le_bytes([
                block[offset],
                block[offset + 1],
                block[offset + 2],
                block[offset + 3],
            ]));
            let state = entry.state(self.max_cluster);
            if state != ClusterState::Allocated {
                trace!("Chain stops with {:?} after {}", state, filled);
                return (state, filled);
            }

            let next = entry.value();
            out[filled] = Cluster(next);
            filled += 1;

            if filled == out.len() || next / self.entries_per_sector != fat_sector {
                return (ClusterState::Allocated, filled);
            }
            index = (next % self.entries_per_sector) as usize;
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
