use crate::{BlockCount, BlockDevice, BlockIdx};

use super::{
    cluster::{Cluster, ClusterState, DataArea},
    Volume,
};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// Default number of cluster numbers a cursor keeps in memory.
pub const DEFAULT_CLUSTER_CACHE: usize = 8;

/// Why a cluster chain couldn't be followed to its end.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// A free cluster was linked into the chain
    Free,
    /// The chain runs through a cluster marked bad
    Bad,
    /// The chain points at a reserved value
    Reserved,
    /// A FAT sector couldn't be read
    ReadError,
    /// More clusters than the volume has: the chain loops
    TooLong,
    /// The first cluster isn't a data cluster
    InvalidStart(Cluster),
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStatus {
    Active,
    EndOfFile,
    Error(ChainError),
}

impl CursorStatus {
    fn after(state: ClusterState) -> Self {
        match state {
            ClusterState::EndOfFile => CursorStatus::EndOfFile,
            ClusterState::Free => CursorStatus::Error(ChainError::Free),
            ClusterState::Bad => CursorStatus::Error(ChainError::Bad),
            ClusterState::Reserved | ClusterState::Allocated => {
                CursorStatus::Error(ChainError::Reserved)
            }
            ClusterState::ReadError => CursorStatus::Error(ChainError::ReadError),
        }
    }
}

/// A forward-only walk over the sectors of a cluster chain.
///
/// At most `N` cluster numbers are held at a time. When they are used up
/// the FAT walker is asked for the next run, starting from the last
/// cluster held. The cursor starts before the first sector, so the first
/// `next_sector` call moves onto it.
#[derive(Debug, Clone)]
pub struct FileCursor<const N: usize = DEFAULT_CLUSTER_CACHE> {
    data_area: DataArea,
    cache: [Cluster; N],
    filled: usize,
    cluster_index: usize,
    sector_index: u32,
    /// What stopped the last walker call.
    walk_state: ClusterState,
    /// The cluster the next walker call continues from.
    tail: Cluster,
    started: bool,
    visited: u32,
    max_visits: u32,
    status: CursorStatus,
}

impl<const N: usize> FileCursor<N> {
    const HAS_CAPACITY: () = assert!(N > 0, "a cursor must hold at least one cluster");

    fn empty(data_area: DataArea, start: Cluster, max_visits: u32) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::HAS_CAPACITY;
        Self {
            data_area,
            cache: [Cluster::default(); N],
            filled: 0,
            cluster_index: 0,
            sector_index: 0,
            walk_state: ClusterState::Allocated,
            tail: start,
            started: false,
            visited: 0,
            max_visits,
            status: CursorStatus::Active,
        }
    }

    /// A cursor over the chain starting at (and including) `start`.
    pub fn new<BD>(volume: &mut Volume<BD>, start: Cluster) -> Self
    where
        BD: BlockDevice,
    {
        let mut cursor = Self::empty(volume.data_area, start, volume.cluster_count());
        if cursor.check_start(volume, start) {
            cursor.cache[0] = start;
            cursor.filled = 1;
            let (state, filled) =
                volume
                    .walker
                    .read_next(&mut volume.block_device, start, &mut cursor.cache[1..]);
            cursor.record_walk(state, filled, 1);
        }
        cursor
    }

    /// A cursor over the clusters after `start`, leaving `start` out.
    pub fn following<BD>(volume: &mut Volume<BD>, start: Cluster) -> Self
    where
        BD: BlockDevice,
    {
        let mut cursor = Self::empty(volume.data_area, start, volume.cluster_count());
        if cursor.check_start(volume, start) {
            let (state, filled) =
                volume
                    .walker
                    .read_next(&mut volume.block_device, start, &mut cursor.cache);
            cursor.record_walk(state, filled, 0);
        }
        cursor
    }

    fn check_start<BD>(&mut self, volume: &Volume<BD>, start: Cluster) -> bool
    where
        BD: BlockDevice,
    {
        if volume.walker.is_valid(start) {
            true
        } else {
            warn!("Chain can't start at cluster {}", start.0);
            self.status = CursorStatus::Error(ChainError::InvalidStart(start));
            false
        }
    }

    fn record_walk(&mut self, state: ClusterState, filled: usize, offset: usize) {
        self.filled = offset + filled;
        self.walk_state = state;
        if self.filled > 0 {
            self.tail = self.cache[self.filled - 1];
        }
    }

    /// Move to the next sector. Returns false once there is none, with the
    /// reason left in `status()`.
    pub fn next_sector<BD>(&mut self, volume: &mut Volume<BD>) -> bool
    where
        BD: BlockDevice,
    {
        if self.status != CursorStatus::Active {
            return false;
        }

        if self.started {
            self.sector_index += 1;
            if self.sector_index < self.data_area.sectors_per_cluster().0 {
                return true;
            }
            self.sector_index = 0;
            self.cluster_index += 1;
        } else {
            self.started = true;
        }

        if self.cluster_index >= self.filled && !self.refill(volume) {
            return false;
        }

        self.visited += 1;
        if self.visited > self.max_visits {
            warn!("Chain is longer than the volume, giving up");
            self.status = CursorStatus::Error(ChainError::TooLong);
            return false;
        }
        true
    }

    fn refill<BD>(&mut self, volume: &mut Volume<BD>) -> bool
    where
        BD: BlockDevice,
    {
        if self.walk_state != ClusterState::Allocated {
            self.status = CursorStatus::after(self.walk_state);
            debug!("Chain ended: {:?}", self.status);
            return false;
        }

        let (state, filled) =
            volume
                .walker
                .read_next(&mut volume.block_device, self.tail, &mut self.cache);
        self.cluster_index = 0;
        self.record_walk(state, filled, 0);
        if filled == 0 {
            self.status = CursorStatus::after(state);
            debug!("Chain ended: {:?}", self.status);
            return false;
        }
        true
    }

    /// The absolute sector the cursor is on. Only meaningful after
    /// `next_sector` returned true.
    pub fn sector_number(&self) -> BlockIdx {
        let cluster = self.cache[self.cluster_index.min(N - 1)];
        self.data_area.first_sector_of_cluster(cluster) + BlockCount(self.sector_index)
    }

    /// The cluster the cursor is in.
    pub fn cluster(&self) -> Cluster {
        self.cache[self.cluster_index.min(N - 1)]
    }

    pub fn status(&self) -> CursorStatus {
        self.status
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
