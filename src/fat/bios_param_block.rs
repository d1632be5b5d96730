use core::num::{NonZeroU16, NonZeroU32, NonZeroU8};

use crate::{Block, BlockCount};

#[cfg(feature = "log")]
use log::warn;

#[cfg(feature = "defmt-log")]
use defmt::warn;

/// Clusters below this count mean a FAT12/16 sized volume, even with FAT32
/// markers.
const FAT32_MIN_CLUSTERS: u32 = 65525;

/// The parsed and checked boot sector of a FAT32 volume.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    bytes_per_sector: NonZeroU16,
    sectors_per_cluster: NonZeroU8,
    reserved_sector_count: NonZeroU16,
    num_fats: NonZeroU8,
    fat_size: NonZeroU32,
    total_sectors: u32,
    root_cluster: u32,
    fs_info_sector: u16,
    mirroring: bool,
    active_fat: u8,
    cluster_count: u32,
    volume_id: u32,
    oem_name: [u8; 8],
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpbError {
    InvalidSignature([u8; 2]),
    Fat32(Fat32BpbError),
    InvalidBytesPerSector(u16),
    InvalidSectorsPerCluster(u8),
    ReservedSectorCountZero,
    NoFats,
    FatSizeZero,
    /// Total sectors don't leave room for a single data cluster
    TooSmall { total_sectors: u32 },
    InvalidActiveFat(u8),
}

/// The fields that must hold particular values on FAT32.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fat32BpbError {
    Count16NotZero,
    FatSize16NotZero,
    RootEntryCountNotZero,
    RootClusterLessThanTwo(u32),
}

impl From<Fat32BpbError> for BpbError {
    fn from(e: Fat32BpbError) -> Self {
        BpbError::Fat32(e)
    }
}

/// The BS_* fields besides the label are not verified.
impl BiosParameterBlock {
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

    pub fn new(block: &Block) -> Result<Self, BpbError> {
        let raw = BiosParameterBlockRaw::new(&block.contents);

        let signature = raw.signature();
        if signature != Self::SIGNATURE {
            return Err(BpbError::InvalidSignature(signature));
        }

        if raw.root_ent_cnt() != 0 {
            return Err(Fat32BpbError::RootEntryCountNotZero.into());
        }
        if raw.fat_sz_16() != 0 {
            return Err(Fat32BpbError::FatSize16NotZero.into());
        }
        if raw.tot_sec_16() != 0 {
            return Err(Fat32BpbError::Count16NotZero.into());
        }

        let bytes_per_sector = Self::bytes_per_sector_checked(raw.bytes_per_sec())?;
        let sectors_per_cluster = Self::sectors_per_cluster_checked(raw.sec_per_clus())?;
        let reserved_sector_count =
            NonZeroU16::new(raw.rsvd_sec_cnt()).ok_or(BpbError::ReservedSectorCountZero)?;
        let num_fats = NonZeroU8::new(raw.num_fats()).ok_or(BpbError::NoFats)?;
        let fat_size = NonZeroU32::new(raw.fat_sz_32()).ok_or(BpbError::FatSizeZero)?;

        let root_cluster = raw.root_clus();
        if root_cluster < 2 {
            return Err(Fat32BpbError::RootClusterLessThanTwo(root_cluster).into());
        }

        // Bit 7 set: only the active FAT (low nibble) is in use.
        let ext_flags = raw.ext_flags();
        let mirroring = ext_flags & 0x80 == 0;
        let active_fat = if mirroring { 0 } else { (ext_flags & 0x0F) as u8 };
        if active_fat >= num_fats.get() {
            return Err(BpbError::InvalidActiveFat(active_fat));
        }

        let total_sectors = raw.tot_sec_32();
        let data_start = u64::from(reserved_sector_count.get())
            + u64::from(num_fats.get()) * u64::from(fat_size.get());
        let data_sectors = u64::from(total_sectors).saturating_sub(data_start);
        let cluster_count = (data_sectors / u64::from(sectors_per_cluster.get())) as u32;
        if cluster_count == 0 {
            return Err(BpbError::TooSmall { total_sectors });
        }

        if cluster_count < FAT32_MIN_CLUSTERS {
            warn!(
                "Only {} clusters, a FAT32 driver shouldn't see this volume",
                cluster_count
            );
        }

        let entries_per_sector = u64::from(bytes_per_sector.get() / 4);
        if u64::from(fat_size.get()) * entries_per_sector < u64::from(cluster_count) + 2 {
            warn!("FAT is too small for {} clusters", cluster_count);
        }

        Ok(BiosParameterBlock {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            num_fats,
            fat_size,
            total_sectors,
            root_cluster,
            fs_info_sector: raw.fs_info(),
            mirroring,
            active_fat,
            cluster_count,
            volume_id: raw.vol_id(),
            oem_name: raw.oem_name(),
            volume_label: raw.vol_lab(),
            fs_type: raw.fil_sys_type(),
        })
    }

    fn bytes_per_sector_checked(bytes_per_sec: u16) -> Result<NonZeroU16, BpbError> {
        match bytes_per_sec {
            512 | 1024 | 2048 | 4096 => NonZeroU16::new(bytes_per_sec),
            _ => None,
        }
        .ok_or(BpbError::InvalidBytesPerSector(bytes_per_sec))
    }

    fn sectors_per_cluster_checked(sectors_per_cluster: u8) -> Result<NonZeroU8, BpbError> {
        if sectors_per_cluster.is_power_of_two() {
            NonZeroU8::new(sectors_per_cluster)
        } else {
            None
        }
        .ok_or(BpbError::InvalidSectorsPerCluster(sectors_per_cluster))
    }

    pub fn bytes_per_sector(&self) -> NonZeroU16 {
        self.bytes_per_sector
    }

    pub fn sectors_per_cluster(&self) -> BlockCount {
        BlockCount(u32::from(self.sectors_per_cluster.get()))
    }

    pub fn reserved_sector_count(&self) -> BlockCount {
        BlockCount(u32::from(self.reserved_sector_count.get()))
    }

    pub fn num_fats(&self) -> u8 {
        self.num_fats.get()
    }

    /// Sectors per FAT copy.
    pub fn fat_size(&self) -> BlockCount {
        BlockCount(self.fat_size.get())
    }

    pub fn total_sectors(&self) -> BlockCount {
        BlockCount(self.total_sectors)
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    /// Volume relative sector of the FSInfo structure.
    pub fn fs_info_sector(&self) -> u16 {
        self.fs_info_sector
    }

    /// Are all FAT copies kept in sync?
    pub fn mirroring(&self) -> bool {
        self.mirroring
    }

    /// The FAT copy that is read. Always 0 when mirroring.
    pub fn active_fat(&self) -> u8 {
        self.active_fat
    }

    /// Number of data clusters, numbered 2 up to `cluster_count() + 1`.
    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn maximum_valid_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    /// Volume relative sector where the data area (cluster 2) starts.
    pub fn data_start(&self) -> BlockCount {
        BlockCount(
            u32::from(self.reserved_sector_count.get())
                + u32::from(self.num_fats.get()) * self.fat_size.get(),
        )
    }

    /// Volume relative first sector of the given FAT copy.
    pub fn fat_start(&self, fat_number: u8) -> BlockCount {
        BlockCount(
            u32::from(self.reserved_sector_count.get()) + u32::from(fat_number) * self.fat_size.get(),
        )
    }

    pub fn volume_id(&self) -> u32 {
        self.volume_id
    }

    pub fn oem_name(&self) -> &[u8; 8] {
        &self.oem_name
    }

    /// The label with padding removed.
    pub fn volume_label(&self) -> &[u8] {
        trim_padding(&self.volume_label)
    }

    /// Informational only, normally "FAT32".
    pub fn fs_type(&self) -> &[u8] {
        trim_padding(&self.fs_type)
    }
}

pub(crate) fn trim_padding(name: &[u8]) -> &[u8] {
    let mut name = name;
    while let [rest @ .., b' '] = name {
        name = rest;
    }
    name
}

/// Field accessors for a raw FAT32 boot sector.
#[derive(Debug)]
pub struct BiosParameterBlockRaw<'a> {
    data: &'a [u8],
}

impl<'a> BiosParameterBlockRaw<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    define_field!(oem_name, [u8; 8], 3);
    define_field!(bytes_per_sec, u16, 11);
    define_field!(sec_per_clus, u8, 13);
    define_field!(rsvd_sec_cnt, u16, 14);
    define_field!(num_fats, u8, 16);
    define_field!(root_ent_cnt, u16, 17);
    define_field!(tot_sec_16, u16, 19);
    define_field!(fat_sz_16, u16, 22);
    define_field!(tot_sec_32, u32, 32);
    define_field!(fat_sz_32, u32, 36);
    define_field!(ext_flags, u16, 40);
    define_field!(root_clus, u32, 44);
    define_field!(fs_info, u16, 48);
    define_field!(vol_id, u32, 67);
    define_field!(vol_lab, [u8; 11], 71);
    define_field!(fil_sys_type, [u8; 8], 82);
    define_field!(signature, [u8; 2], 510);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn boot_sector(
        sectors_per_cluster: u8,
        reserved: u16,
        num_fats: u8,
        fat_size: u32,
        total: u32,
    ) -> Block {
        let mut block = Block::new();
        block[0..3].copy_from_slice(&hex!("EB 58 90"));
        block[3..11].copy_from_slice(b"MSWIN4.1");
        block[11..13].copy_from_slice(&512u16.to_le_bytes());
        block[13] = sectors_per_cluster;
        block[14..16].copy_from_slice(&reserved.to_le_bytes());
        block[16] = num_fats;
        block[21] = 0xF8;
        block[32..36].copy_from_slice(&total.to_le_bytes());
        block[36..40].copy_from_slice(&fat_size.to_le_bytes());
        block[44..48].copy_from_slice(&2u32.to_le_bytes());
        block[48..50].copy_from_slice(&1u16.to_le_bytes());
        block[71..82].copy_from_slice(b"MY CARD    ");
        block[82..90].copy_from_slice(b"FAT32   ");
        block[510..512].copy_from_slice(&BiosParameterBlock::SIGNATURE);
        block
    }

    #[test]
    fn geometry_of_a_typical_card() {
        let block = boot_sector(8, 32, 2, 1024, 2080 + 8 * 130_000);
        let bpb = BiosParameterBlock::new(&block).unwrap();
        assert_eq!(bpb.data_start(), BlockCount(2080));
        assert_eq!(bpb.fat_start(0), BlockCount(32));
        assert_eq!(bpb.fat_start(1), BlockCount(32 + 1024));
        assert_eq!(bpb.sectors_per_cluster(), BlockCount(8));
        assert_eq!(bpb.cluster_count(), 130_000);
        assert_eq!(bpb.root_cluster(), 2);
        assert!(bpb.mirroring());
        assert_eq!(bpb.volume_label(), b"MY CARD");
        assert_eq!(bpb.fs_type(), b"FAT32");
        assert_eq!(bpb.oem_name(), b"MSWIN4.1");
    }

    #[test]
    fn fat16_markers_are_rejected() {
        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[17..19].copy_from_slice(&512u16.to_le_bytes());
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::Fat32(Fat32BpbError::RootEntryCountNotZero))
        );

        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[22..24].copy_from_slice(&200u16.to_le_bytes());
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::Fat32(Fat32BpbError::FatSize16NotZero))
        );

        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[19..21].copy_from_slice(&60000u16.to_le_bytes());
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::Fat32(Fat32BpbError::Count16NotZero))
        );
    }

    #[test]
    fn broken_fields_are_rejected() {
        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[511] = 0;
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::InvalidSignature([0x55, 0x00]))
        );

        let block = boot_sector(3, 32, 2, 1024, 2_000_000);
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::InvalidSectorsPerCluster(3))
        );

        let block = boot_sector(8, 0, 2, 1024, 2_000_000);
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::ReservedSectorCountZero)
        );

        let block = boot_sector(8, 32, 2, 1024, 2000);
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::TooSmall {
                total_sectors: 2000
            })
        );

        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[40] = 0x82;
        assert_eq!(
            BiosParameterBlock::new(&block),
            Err(BpbError::InvalidActiveFat(2))
        );
    }

    #[test]
    fn active_fat_without_mirroring() {
        let mut block = boot_sector(8, 32, 2, 1024, 2_000_000);
        block[40] = 0x81;
        let bpb = BiosParameterBlock::new(&block).unwrap();
        assert!(!bpb.mirroring());
        assert_eq!(bpb.active_fat(), 1);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
