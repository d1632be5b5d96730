use crate::Block;

/// Hands out the bytes of one cached block in arbitrary sized pieces.
#[derive(Debug, Clone, Default)]
pub struct BlockByteCache {
    byte_index: usize,
    current_cache: Option<Block>,
}

impl BlockByteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached block and start over at its first byte.
    pub fn feed(&mut self, block: Block) {
        self.current_cache = Some(block);
        self.byte_index = 0;
    }

    pub fn all_cached_bytes_read(&self) -> bool {
        self.current_cache.is_none()
    }

    pub fn clear(&mut self) {
        self.byte_index = 0;
        self.current_cache.take();
    }

    /// Copy as many cached bytes as fit into `data`, returning the count.
    /// The block is dropped once its last byte is handed out.
    pub fn read(&mut self, data: &mut [u8]) -> usize {
        let cache = match &self.current_cache {
            Some(cache) => cache,
            None => return 0,
        };

        let data_to_read = data.len().min(Block::LEN - self.byte_index);
        data[..data_to_read]
            .copy_from_slice(&cache.contents[self.byte_index..self.byte_index + data_to_read]);
        self.byte_index += data_to_read;

        if self.byte_index == Block::LEN {
            self.clear();
        }

        data_to_read
    }
}
