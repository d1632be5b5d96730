use core::fmt::Debug;

use crate::BlockDevice;

use super::{
    block_byte_cache::BlockByteCache,
    cursor::{ChainError, CursorStatus, FileCursor, DEFAULT_CLUSTER_CACHE},
    directory::DirEntry,
    Volume,
};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileError<E>
where
    E: Debug,
{
    DeviceError(E),
    IsADirectory,
    Chain(ChainError),
    /// The cluster chain has fewer sectors than the size in the directory
    /// entry claims. Holds the byte offset where data ran out.
    ChainEndedEarly { position: u32 },
}

/// A file opened for sequential reading.
///
/// `N` is the number of cluster numbers cached at a time.
#[derive(Debug, Clone)]
pub struct File<const N: usize = DEFAULT_CLUSTER_CACHE> {
    cursor: FileCursor<N>,
    read_cache: BlockByteCache,
    size: u32,
    position: u32,
}

impl<const N: usize> File<N> {
    /// Open the file described by `dir_entry`.
    pub fn open<BD>(
        volume: &mut Volume<BD>,
        dir_entry: &DirEntry,
    ) -> Result<Self, FileError<BD::Error>>
    where
        BD: BlockDevice,
    {
        if dir_entry.is_dir() {
            return Err(FileError::IsADirectory);
        }
        Ok(Self {
            cursor: FileCursor::new(volume, dir_entry.first_cluster),
            read_cache: BlockByteCache::new(),
            size: dir_entry.size,
            position: 0,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes read so far.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position >= self.size
    }

    /// Read up to `data.len()` bytes, returning how many were read. Zero
    /// means the end of the file.
    ///
    /// A chain error is reported once the bytes before it have been
    /// handed out.
    pub fn read<BD>(
        &mut self,
        volume: &mut Volume<BD>,
        data: &mut [u8],
    ) -> Result<usize, FileError<BD::Error>>
    where
        BD: BlockDevice,
    {
        let mut read_bytes_total = 0;

        while read_bytes_total < data.len() && !self.is_eof() {
            if self.read_cache.all_cached_bytes_read() {
                if !self.cursor.next_sector(volume) {
                    if read_bytes_total > 0 {
                        break;
                    }
                    return Err(self.chain_error());
                }
                let sector = self.cursor.sector_number();
                trace!("File sector {} at {}", sector.0, self.position);
                let block = volume
                    .block_device
                    .read_block(sector, "read_file")
                    .map_err(FileError::DeviceError)?;
                self.read_cache.feed(block);
            }

            let left = (self.size - self.position) as usize;
            let end = data.len().min(read_bytes_total + left);
            let read_bytes = self.read_cache.read(&mut data[read_bytes_total..end]);
            read_bytes_total += read_bytes;
            self.position += read_bytes as u32;
        }

        Ok(read_bytes_total)
    }

    fn chain_error<E>(&self) -> FileError<E>
    where
        E: Debug,
    {
        match self.cursor.status() {
            CursorStatus::Error(e) => FileError::Chain(e),
            CursorStatus::EndOfFile | CursorStatus::Active => {
                warn!(
                    "Chain ends at {} of {} bytes",
                    self.position, self.size
                );
                FileError::ChainEndedEarly {
                    position: self.position,
                }
            }
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
