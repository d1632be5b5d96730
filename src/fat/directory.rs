use core::fmt::{self, Debug, Write};

use crate::BlockDevice;

use super::{
    bios_param_block::trim_padding,
    block_byte_cache::BlockByteCache,
    cluster::Cluster,
    cursor::{ChainError, CursorStatus, FileCursor, DEFAULT_CLUSTER_CACHE},
    Volume,
};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

bitflags::bitflags! {
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const VOLUME_ID = (1 << 3);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
        const LONG_NAME = Self::READ_ONLY.bits | Self::HIDDEN.bits | Self::SYSTEM.bits | Self::VOLUME_ID.bits;
    }
}

impl Attributes {
    /// Exactly the long name combination, nothing else.
    pub fn is_long_name(&self) -> bool {
        *self == Self::LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }

    pub fn is_volume_label(&self) -> bool {
        self.contains(Self::VOLUME_ID) && !self.is_long_name()
    }
}

#[cfg(feature = "defmt-log")]
impl defmt::Format for Attributes {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Attributes({=u8:#x})", self.bits())
    }
}

/// Size of one directory slot.
pub const DIR_ENTRY_LEN: usize = 32;

/// An 8.3 name as stored on disk, space padded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    raw: [u8; 11],
}

impl ShortName {
    pub fn new(raw: [u8; 11]) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8; 11] {
        &self.raw
    }

    pub fn base(&self) -> &[u8] {
        trim_padding(&self.raw[..8])
    }

    pub fn extension(&self) -> &[u8] {
        trim_padding(&self.raw[8..])
    }

    /// The checksum every long name fragment of this entry carries.
    pub fn checksum(&self) -> u8 {
        self.raw
            .iter()
            .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
    }

    /// Case-insensitive comparison with `NAME.EXT`.
    pub fn matches(&self, name: &str) -> bool {
        let (base, ext) = match name.rfind('.') {
            Some(dot) if dot > 0 && name != ".." => (&name[..dot], &name[dot + 1..]),
            _ => (name, ""),
        };
        self.base().eq_ignore_ascii_case(base.as_bytes())
            && self.extension().eq_ignore_ascii_case(ext.as_bytes())
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.base() {
            f.write_char(char::from(b))?;
        }
        if !self.extension().is_empty() {
            f.write_char('.')?;
            for &b in self.extension() {
                f.write_char(char::from(b))?;
            }
        }
        Ok(())
    }
}

impl Debug for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortName(\"{}\")", self)
    }
}

/// A long file name: up to 255 UTF-16 code units.
#[derive(Clone)]
pub struct LongName {
    units: [u16; LongName::MAX_LEN],
    len: usize,
}

impl LongName {
    pub const MAX_LEN: usize = 255;

    pub fn units(&self) -> &[u16] {
        &self.units[..self.len]
    }

    /// Decoded characters, unpaired surrogates replaced.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        core::char::decode_utf16(self.units().iter().cloned())
            .map(|c| c.unwrap_or(core::char::REPLACEMENT_CHARACTER))
    }

    /// Comparison that ignores ASCII case.
    pub fn matches(&self, name: &str) -> bool {
        let mut ours = self.chars();
        let mut theirs = name.chars();
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a.eq_ignore_ascii_case(&b) => {}
                _ => return false,
            }
        }
    }
}

impl PartialEq for LongName {
    fn eq(&self, other: &Self) -> bool {
        self.units() == other.units()
    }
}

impl Eq for LongName {}

impl fmt::Display for LongName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.chars() {
            f.write_char(c)?;
        }
        Ok(())
    }
}

impl Debug for LongName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LongName(\"{}\")", self)
    }
}

/// Last modification time, with the two second resolution of FAT.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl Timestamp {
    pub fn from_fat(date: u16, time: u16) -> Self {
        Self {
            year: 1980 + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hours: (time >> 11) as u8,
            minutes: ((time >> 5) & 0x3F) as u8,
            seconds: ((time & 0x1F) * 2) as u8,
        }
    }
}

/// Field accessors for one 32 byte directory slot.
#[derive(Debug)]
pub struct DirEntryRaw<'a> {
    data: &'a [u8],
}

impl<'a> DirEntryRaw<'a> {
    pub fn new(data: &'a [u8; DIR_ENTRY_LEN]) -> Self {
        Self { data }
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    define_field!(name, [u8; 11], 0);
    define_field!(attr, u8, 11);
    define_field!(fst_clus_hi, u16, 20);
    define_field!(wrt_time, u16, 22);
    define_field!(wrt_date, u16, 24);
    define_field!(fst_clus_lo, u16, 26);
    define_field!(file_size, u32, 28);

    define_field!(ord, u8, 0);
    define_field!(chksum, u8, 13);

    fn lfn_unit(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }
}

/// A long name fragment: 13 code units of the name.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LfnFragment {
    /// Position of the fragment in the name, counting from 1.
    pub ordinal: u8,
    /// Set on the fragment holding the end of the name, which comes first.
    pub last: bool,
    pub checksum: u8,
    pub units: [u16; LfnFragment::UNITS],
}

impl LfnFragment {
    pub const UNITS: usize = 13;
    const MAX_ORDINAL: u8 = 20;
    const UNIT_OFFSETS: [usize; LfnFragment::UNITS] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

    fn decode(raw: &DirEntryRaw) -> Self {
        let mut units = [0u16; Self::UNITS];
        for (unit, &offset) in units.iter_mut().zip(Self::UNIT_OFFSETS.iter()) {
            *unit = raw.lfn_unit(offset);
        }
        Self {
            ordinal: raw.ord() & 0x1F,
            last: raw.ord() & 0x40 != 0,
            checksum: raw.chksum(),
            units,
        }
    }
}

/// A regular (8.3) directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    pub first_cluster: Cluster,
    pub size: u32,
    pub modified: Timestamp,
}

/// A decoded 32 byte directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Lead byte 0x00: never used
    Unused,
    /// Lead byte 0xE5
    Deleted,
    LongName(LfnFragment),
    Short(ShortEntry),
}

impl Record {
    pub fn decode(slot: &[u8; DIR_ENTRY_LEN]) -> Self {
        let raw = DirEntryRaw::new(slot);
        match slot[0] {
            0x00 => return Record::Unused,
            0xE5 => return Record::Deleted,
            _ => {}
        }

        let attributes = Attributes::from_bits_truncate(raw.attr());
        if attributes.is_long_name() {
            return Record::LongName(LfnFragment::decode(&raw));
        }

        let cluster = u32::from(raw.fst_clus_hi()) << 16 | u32::from(raw.fst_clus_lo());
        Record::Short(ShortEntry {
            name: ShortName::new(raw.name()),
            attributes,
            first_cluster: Cluster(cluster),
            size: raw.file_size(),
            modified: Timestamp::from_fat(raw.wrt_date(), raw.wrt_time()),
        })
    }
}

/// Collects long name fragments until the short entry they belong to.
#[derive(Clone)]
struct LongNameBuilder {
    units: [u16; LfnFragment::UNITS * LfnFragment::MAX_ORDINAL as usize],
    count: u8,
    expected: u8,
    checksum: u8,
    active: bool,
}

impl LongNameBuilder {
    fn new() -> Self {
        Self {
            units: [0; LfnFragment::UNITS * LfnFragment::MAX_ORDINAL as usize],
            count: 0,
            expected: 0,
            checksum: 0,
            active: false,
        }
    }

    fn reset(&mut self) {
        self.active = false;
    }

    fn push(&mut self, fragment: &LfnFragment) {
        if fragment.ordinal == 0 || fragment.ordinal > LfnFragment::MAX_ORDINAL {
            warn!("Long name fragment with ordinal {}", fragment.ordinal);
            self.reset();
            return;
        }

        if fragment.last {
            if self.active {
                warn!("Long name without its short entry dropped");
            }
            self.active = true;
            self.count = fragment.ordinal;
            self.expected = fragment.ordinal;
            self.checksum = fragment.checksum;
        } else if !self.active
            || fragment.ordinal != self.expected
            || fragment.checksum != self.checksum
        {
            warn!("Orphaned long name fragment {}", fragment.ordinal);
            self.reset();
            return;
        }

        let start = usize::from(fragment.ordinal - 1) * LfnFragment::UNITS;
        self.units[start..start + LfnFragment::UNITS].copy_from_slice(&fragment.units);
        self.expected = fragment.ordinal - 1;
    }

    fn finish(&mut self, short_name: &ShortName) -> Option<LongName> {
        if !self.active {
            return None;
        }
        self.reset();

        if self.expected != 0 {
            warn!("Long name is missing fragment {}", self.expected);
            return None;
        }
        let checksum = short_name.checksum();
        if checksum != self.checksum {
            warn!(
                "Long name checksum {:#x} doesn't match short name {:#x}",
                self.checksum, checksum
            );
            return None;
        }

        let total = usize::from(self.count) * LfnFragment::UNITS;
        let len = self.units[..total]
            .iter()
            .position(|&u| u == 0x0000)
            .unwrap_or(total)
            .min(LongName::MAX_LEN);
        let mut units = [0u16; LongName::MAX_LEN];
        units[..len].copy_from_slice(&self.units[..len]);
        Some(LongName { units, len })
    }
}

/// A file or directory found in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortName,
    /// Only with the `lfn` feature, and only when a valid long name was
    /// stored with the entry.
    pub long_name: Option<LongName>,
    pub attributes: Attributes,
    /// Cluster 0 on empty files, and on `..` entries pointing at the root.
    pub first_cluster: Cluster,
    pub size: u32,
    pub modified: Timestamp,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }

    /// Compare with the long name if there is one, and with `NAME.EXT`.
    /// Case is ignored.
    pub fn name_matches(&self, name: &str) -> bool {
        if let Some(long_name) = &self.long_name {
            if long_name.matches(name) {
                return true;
            }
        }
        self.name.matches(name)
    }
}

/// What one slot meant to the [`DirectoryDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Entry(DirEntry),
}

/// Turns a directory's slots, fed in order, into entries. Pure: the same
/// slots always decode to the same entries.
#[derive(Clone)]
pub struct DirectoryDecoder {
    long_name: LongNameBuilder,
}

impl Default for DirectoryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryDecoder {
    pub fn new() -> Self {
        Self {
            long_name: LongNameBuilder::new(),
        }
    }

    pub fn push(&mut self, slot: &[u8; DIR_ENTRY_LEN]) -> Step {
        match Record::decode(slot) {
            Record::Unused | Record::Deleted => {
                self.long_name.reset();
                Step::Continue
            }
            Record::LongName(fragment) => {
                if cfg!(feature = "lfn") {
                    self.long_name.push(&fragment);
                }
                Step::Continue
            }
            Record::Short(entry) => {
                let long_name = self.long_name.finish(&entry.name);
                if entry.attributes.is_volume_label() {
                    return Step::Continue;
                }
                Step::Entry(DirEntry {
                    name: entry.name,
                    long_name,
                    attributes: entry.attributes,
                    first_cluster: entry.first_cluster,
                    size: entry.size,
                    modified: entry.modified,
                })
            }
        }
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirError<E>
where
    E: Debug,
{
    DeviceError(E),
    Chain(ChainError),
    NotADirectory,
    NotFound,
}

/// Iterates the entries of one directory.
pub struct DirIter<'a, BD, const N: usize = DEFAULT_CLUSTER_CACHE>
where
    BD: BlockDevice,
{
    volume: &'a mut Volume<BD>,
    cursor: FileCursor<N>,
    block_cache: BlockByteCache,
    decoder: DirectoryDecoder,
    total_entries_read: usize,
    finished: bool,
}

impl<'a, BD, const N: usize> Debug for DirIter<'a, BD, N>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirIter")
            .field("cursor", &self.cursor)
            .field("total_entries_read", &self.total_entries_read)
            .finish()
    }
}

impl<'a, BD, const N: usize> DirIter<'a, BD, N>
where
    BD: BlockDevice,
{
    /// Iterate the directory starting at `cluster`.
    pub fn new(volume: &'a mut Volume<BD>, cluster: Cluster) -> Self {
        let cursor = FileCursor::new(volume, cluster);
        Self {
            volume,
            cursor,
            block_cache: BlockByteCache::new(),
            decoder: DirectoryDecoder::new(),
            total_entries_read: 0,
            finished: false,
        }
    }

    /// Slots looked at so far, used or not.
    pub fn total_entries_read(&self) -> usize {
        self.total_entries_read
    }
}

impl<'a, BD, const N: usize> Iterator for DirIter<'a, BD, N>
where
    BD: BlockDevice,
{
    type Item = Result<DirEntry, DirError<BD::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut slot = [0u8; DIR_ENTRY_LEN];
        while !self.finished {
            if self.block_cache.all_cached_bytes_read() {
                if !self.cursor.next_sector(self.volume) {
                    self.finished = true;
                    return match self.cursor.status() {
                        CursorStatus::Error(e) => Some(Err(DirError::Chain(e))),
                        CursorStatus::EndOfFile | CursorStatus::Active => None,
                    };
                }
                let sector = self.cursor.sector_number();
                trace!("Directory sector {}", sector.0);
                match self.volume.block_device.read_block(sector, "read_dir") {
                    Ok(block) => self.block_cache.feed(block),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(DirError::DeviceError(e)));
                    }
                }
            }

            if self.block_cache.read(&mut slot) != DIR_ENTRY_LEN {
                continue;
            }
            self.total_entries_read += 1;
            match self.decoder.push(&slot) {
                Step::Continue => {}
                Step::Entry(entry) => return Some(Ok(entry)),
            }
        }
        None
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
