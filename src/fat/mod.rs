//! sdfat32 - FAT32 volumes
//!
//! Mounts a FAT32 volume on a [`BlockDevice`], follows cluster chains
//! through the FAT and reads directories and files.

use core::fmt::Debug;

use crate::{
    mbr::{Mbr, MbrError},
    Block, BlockCount, BlockDevice, BlockIdx,
};

pub mod bios_param_block;
pub mod block_byte_cache;
pub mod cluster;
pub mod cursor;
pub mod directory;
pub mod file;
pub mod fs_info;


pub use self::{
    bios_param_block::{BiosParameterBlock, BpbError},
    cluster::{Cluster, ClusterState, DataArea, FatWalker},
    cursor::{ChainError, CursorStatus, FileCursor},
    directory::{Attributes, DirEntry, DirError, DirIter, DirectoryDecoder, LongName, ShortName},
    file::{File, FileError},
    fs_info::FsInfo,
};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountError<E>
where
    E: Debug,
{
    DeviceError(E),
    /// The boot sector isn't a valid FAT32 one
    NotFat32(BpbError),
    /// Valid for FAT32, but not the block size this crate works with
    UnsupportedSectorSize(u16),
    /// The volume ends past the last addressable sector
    VolumeOutOfRange {
        first_sector: BlockIdx,
        total_sectors: BlockCount,
    },
    Mbr(MbrError<E>),
}

impl<E> From<MbrError<E>> for MountError<E>
where
    E: Debug,
{
    fn from(e: MbrError<E>) -> Self {
        match e {
            MbrError::DeviceError(e) => MountError::DeviceError(e),
            other => MountError::Mbr(other),
        }
    }
}

/// Two FAT copies disagree.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatMismatch {
    /// The copy that differs from the active one
    pub fat: u8,
    /// Sector offset within the FAT
    pub sector: BlockCount,
}

/// A mounted FAT32 volume. Owns its block device; use `&mut device` or
/// `&RefCell<device>` to keep it.
pub struct Volume<BD>
where
    BD: BlockDevice,
{
    block_device: BD,
    first_sector: BlockIdx,
    bpb: BiosParameterBlock,
    walker: FatWalker,
    data_area: DataArea,
}

impl<BD> Debug for Volume<BD>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Volume")
            .field("first_sector", &self.first_sector)
            .field("bpb", &self.bpb)
            .finish()
    }
}

impl<BD> Volume<BD>
where
    BD: BlockDevice,
{
    /// Mount the FAT32 volume whose boot sector is at `first_sector`.
    ///
    /// Only the boot sector is read. FAT copies are not compared, see
    /// [`Volume::find_fat_mirror_mismatch`].
    pub fn open(
        mut block_device: BD,
        first_sector: BlockIdx,
    ) -> Result<Self, MountError<BD::Error>> {
        let boot_sector = block_device
            .read_block(first_sector, "read_bpb")
            .map_err(MountError::DeviceError)?;
        let bpb = BiosParameterBlock::new(&boot_sector).map_err(MountError::NotFat32)?;

        let bytes_per_sector = bpb.bytes_per_sector().get();
        if usize::from(bytes_per_sector) != Block::LEN {
            return Err(MountError::UnsupportedSectorSize(bytes_per_sector));
        }

        let total_sectors = bpb.total_sectors();
        if first_sector.0.checked_add(total_sectors.0).is_none() {
            return Err(MountError::VolumeOutOfRange {
                first_sector,
                total_sectors,
            });
        }

        let entries_per_sector = Block::LEN_U32 / 4;
        let fat_entries = bpb.fat_size().0.saturating_mul(entries_per_sector);
        let max_cluster = bpb
            .maximum_valid_cluster()
            .min(fat_entries.saturating_sub(1));
        let walker = FatWalker::new(
            first_sector + bpb.fat_start(bpb.active_fat()),
            entries_per_sector,
            max_cluster,
        );
        let data_area = DataArea::new(first_sector + bpb.data_start(), bpb.sectors_per_cluster());

        debug!(
            "FAT32 at {}: {} clusters of {} sectors, data at {}, root cluster {}",
            first_sector.0,
            bpb.cluster_count(),
            bpb.sectors_per_cluster().0,
            data_area.first_sector().0,
            bpb.root_cluster()
        );
        if !bpb.mirroring() {
            debug!("FAT mirroring off, using FAT {}", bpb.active_fat());
        }

        Ok(Self {
            block_device,
            first_sector,
            bpb,
            walker,
            data_area,
        })
    }

    /// Mount the first FAT32 partition listed in the MBR.
    pub fn open_first_fat32(mut block_device: BD) -> Result<Self, MountError<BD::Error>> {
        let partition = Mbr::find_fat32(&mut block_device)?;
        Self::open(block_device, partition.lba_start)
    }

    /// Give the block device back.
    pub fn release(self) -> BD {
        self.block_device
    }

    pub fn device(&mut self) -> &mut BD {
        &mut self.block_device
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// Absolute sector of the boot sector.
    pub fn first_sector(&self) -> BlockIdx {
        self.first_sector
    }

    pub fn data_area(&self) -> &DataArea {
        &self.data_area
    }

    pub fn walker(&self) -> &FatWalker {
        &self.walker
    }

    pub fn sectors_per_cluster(&self) -> BlockCount {
        self.data_area.sectors_per_cluster()
    }

    pub fn cluster_count(&self) -> u32 {
        self.bpb.cluster_count()
    }

    pub fn root_cluster(&self) -> Cluster {
        Cluster(self.bpb.root_cluster())
    }

    /// Absolute sector of the first FAT copy that is read.
    pub fn fat_first_sector(&self) -> BlockIdx {
        self.walker.fat_start()
    }

    pub fn entries_per_fat_sector(&self) -> u32 {
        self.walker.entries_per_sector()
    }

    pub fn first_sector_of_cluster(&self, cluster: Cluster) -> BlockIdx {
        self.data_area.first_sector_of_cluster(cluster)
    }

    /// Read a sector, counted from the start of the volume.
    pub fn read_sector(&mut self, sector: BlockIdx) -> Result<Block, BD::Error> {
        self.block_device
            .read_block(self.first_sector + BlockCount(sector.0), "read_sector")
    }

    /// Collect the clusters following `cluster`, see [`FatWalker::read_next`].
    pub fn read_next(&mut self, cluster: Cluster, out: &mut [Cluster]) -> (ClusterState, usize) {
        self.walker.read_next(&mut self.block_device, cluster, out)
    }

    /// The entries of the root directory.
    pub fn root_dir(&mut self) -> DirIter<'_, BD> {
        let root = self.root_cluster();
        DirIter::new(self, root)
    }

    /// The entries of the directory starting at `cluster`. Cluster 0, as
    /// found in `..` entries, means the root directory.
    pub fn dir_at(&mut self, cluster: Cluster) -> DirIter<'_, BD> {
        let cluster = if cluster.0 == 0 {
            self.root_cluster()
        } else {
            cluster
        };
        DirIter::new(self, cluster)
    }

    /// The entries of a subdirectory.
    pub fn dir(&mut self, entry: &DirEntry) -> Result<DirIter<'_, BD>, DirError<BD::Error>> {
        if !entry.is_dir() {
            return Err(DirError::NotADirectory);
        }
        Ok(self.dir_at(entry.first_cluster))
    }

    /// Open a file for reading. Use [`File::open`] for a different
    /// cluster cache size.
    pub fn open_file(&mut self, entry: &DirEntry) -> Result<File, FileError<BD::Error>> {
        File::open(self, entry)
    }

    /// Look up `name` in the directory starting at `dir_cluster`.
    pub fn find(
        &mut self,
        dir_cluster: Cluster,
        name: &str,
    ) -> Result<DirEntry, DirError<BD::Error>> {
        for entry in self.dir_at(dir_cluster) {
            let entry = entry?;
            if entry.name_matches(name) {
                return Ok(entry);
            }
        }
        Err(DirError::NotFound)
    }

    /// Look up a `/` separated path from the root directory. Empty
    /// components are ignored; a path naming the root itself is `NotFound`
    /// since the root has no entry.
    pub fn find_path(&mut self, path: &str) -> Result<DirEntry, DirError<BD::Error>> {
        let mut dir = self.root_cluster();
        let mut found: Option<DirEntry> = None;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if let Some(entry) = &found {
                if !entry.is_dir() {
                    return Err(DirError::NotADirectory);
                }
                dir = entry.first_cluster;
            }
            found = Some(self.find(dir, component)?);
        }
        found.ok_or(DirError::NotFound)
    }

    /// Read the FSInfo sector. `None` if the volume has none or its
    /// signatures are wrong.
    pub fn read_fs_info(&mut self) -> Result<Option<FsInfo>, BD::Error> {
        let sector = self.bpb.fs_info_sector();
        if sector == 0 || sector == 0xFFFF {
            return Ok(None);
        }
        let block = self.read_sector(BlockIdx(u32::from(sector)))?;
        let info = FsInfo::new(&block);
        if info.is_none() {
            warn!("FSInfo sector {} has bad signatures", sector);
        }
        Ok(info)
    }

    /// Compare every FAT copy with the active one, sector by sector.
    /// Returns the first difference. Nothing is repaired.
    pub fn find_fat_mirror_mismatch(&mut self) -> Result<Option<FatMismatch>, BD::Error> {
        let active = self.bpb.active_fat();
        for offset in 0..self.bpb.fat_size().0 {
            let offset = BlockCount(offset);
            let reference = self.block_device.read_block(
                self.first_sector + self.bpb.fat_start(active) + offset,
                "read_fat",
            )?;
            for fat in (0..self.bpb.num_fats()).filter(|&fat| fat != active) {
                let copy = self.block_device.read_block(
                    self.first_sector + self.bpb.fat_start(fat) + offset,
                    "read_fat_copy",
                )?;
                if copy != reference {
                    warn!("FAT {} differs at sector {}", fat, offset.0);
                    return Ok(Some(FatMismatch {
                        fat,
                        sector: offset,
                    }));
                }
            }
        }
        Ok(None)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
