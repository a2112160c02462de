//! Block arithmetic for the Block Store.
//!
//! The Block Store is a flat run of [`BLOCK_SIZE`]-byte blocks that starts
//! right after the Table and the Header.  A file occupies `block_count`
//! consecutive blocks; only the tail of its last block may be short, and that
//! tail is never padded on disk.

use crate::header::HEADER_SIZE;
use crate::table::TABLE_SIZE;

/// Size of one Block Store block: 256 KiB.
pub const BLOCK_SIZE: usize = 262_144;

/// Absolute container offset of block 0.
pub const STORE_OFFSET: u64 = (TABLE_SIZE + HEADER_SIZE) as u64;

/// Number of blocks needed to hold `byte_size` bytes (`ceil(size / BLOCK_SIZE)`).
pub fn blocks_for(byte_size: u64) -> u64 {
    byte_size.div_ceil(BLOCK_SIZE as u64)
}

/// Absolute container offset of `block`.
pub fn block_offset(block: u32) -> u64 {
    STORE_OFFSET + block as u64 * BLOCK_SIZE as u64
}

/// Absolute offset one past the last payload byte of a file.
pub fn data_end(starting_block: u32, byte_size: u32) -> u64 {
    block_offset(starting_block) + byte_size as u64
}

/// Length of the next chunk when `done` of `total` bytes have moved.
pub fn chunk_len(total: u64, done: u64) -> usize {
    (total - done).min(BLOCK_SIZE as u64) as usize
}

/// The one transfer buffer an operation reuses for every chunk it moves.
pub struct ChunkBuf {
    buf: Vec<u8>,
}

impl ChunkBuf {
    pub fn new() -> Self {
        Self { buf: vec![0u8; BLOCK_SIZE] }
    }

    /// First `len` bytes of the buffer.  `len` is clipped to [`BLOCK_SIZE`].
    pub fn slice(&mut self, len: usize) -> &mut [u8] {
        &mut self.buf[..len.min(BLOCK_SIZE)]
    }
}

impl Default for ChunkBuf {
    fn default() -> Self {
        Self::new()
    }
}
