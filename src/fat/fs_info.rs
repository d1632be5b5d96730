use crate::Block;

/// The FSInfo sector: free space hints kept by the formatter and drivers.
/// Both values may be stale, they are hints.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    /// Last known number of free clusters
    pub free_count: Option<u32>,
    /// Where to start looking for a free cluster
    pub next_free: Option<u32>,
}

impl FsInfo {
    const LEAD_SIGNATURE: u32 = 0x4161_5252;
    const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
    const UNKNOWN: u32 = 0xFFFF_FFFF;

    /// `None` unless all three signatures are in place.
    pub fn new(block: &Block) -> Option<Self> {
        let raw = FsInfoRaw { data: &block.contents };
        if raw.lead_sig() != Self::LEAD_SIGNATURE
            || raw.struc_sig() != Self::STRUCT_SIGNATURE
            || raw.trail_sig() != Self::TRAIL_SIGNATURE
        {
            return None;
        }
        let known = |v: u32| if v == Self::UNKNOWN { None } else { Some(v) };
        Some(Self {
            free_count: known(raw.free_count()),
            next_free: known(raw.nxt_free()),
        })
    }
}

struct FsInfoRaw<'a> {
    data: &'a [u8],
}

impl<'a> FsInfoRaw<'a> {
    fn data(&self) -> &[u8] {
        self.data
    }

    define_field!(lead_sig, u32, 0);
    define_field!(struc_sig, u32, 484);
    define_field!(free_count, u32, 488);
    define_field!(nxt_free, u32, 492);
    define_field!(trail_sig, u32, 508);
}
