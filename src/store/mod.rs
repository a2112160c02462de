//! Block Store I/O over an open container.
//!
//! [`Container`] owns the underlying handle for the duration of one
//! operation.  Opening it loads the Table and validates the Header; the
//! Table then lives in memory until [`Container::save_table`] writes all 256
//! slots back to offset 0.
//!
//! Payload moves through one [`ChunkBuf`] of `BLOCK_SIZE` bytes, so memory
//! use does not grow with file size.  Data for a file is written at the exact
//! offset of its starting block; nothing pads the last block, and the space
//! between a short tail and the next file's first block is left as a hole.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use thiserror::Error;

use crate::block::{block_offset, chunk_len, data_end, ChunkBuf, STORE_OFFSET};
use crate::header::{Header, HeaderError};
use crate::table::{Relocation, Table, TableEntry, TableError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("header: {0}")]
    Header(#[from] HeaderError),
    #[error("table: {0}")]
    Table(#[from] TableError),
    #[error("expected {expected} bytes, only {actual} available")]
    ShortRead { expected: u64, actual: u64 },
    #[error("refusing to move block {from_block} up to block {to_block}")]
    UpwardMove { from_block: u32, to_block: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Handles a container can live in: anything seekable that can also be cut
/// short after compaction.
pub trait Storage: Read + Write + Seek {
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl Storage for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl Storage for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

pub struct Container<F> {
    inner:      F,
    pub header: Header,
    pub table:  Table,
    buf:        ChunkBuf,
}

impl<F: Read + Seek> Container<F> {
    /// Load the Table and Header of an existing container.
    pub fn open(mut inner: F) -> Result<Self, StoreError> {
        inner.seek(SeekFrom::Start(0))?;
        let table  = Table::load(&mut inner)?;
        let header = Header::read(&mut inner)?;
        Ok(Self { inner, header, table, buf: ChunkBuf::new() })
    }

    /// Current container length in bytes.
    pub fn len(&mut self) -> io::Result<u64> {
        self.inner.seek(SeekFrom::End(0))
    }

    /// Bytes of `entry`'s payload actually present in the container.
    pub fn available(&mut self, entry: &TableEntry) -> io::Result<u64> {
        let start = block_offset(entry.starting_block);
        Ok(self.len()?.saturating_sub(start).min(entry.byte_size as u64))
    }

    /// Copy exactly `entry.byte_size` bytes of payload into `out`.
    ///
    /// On a short read everything read so far has already reached `out`.
    pub fn read_entry<W: Write>(&mut self, entry: &TableEntry, mut out: W) -> Result<u64, StoreError> {
        let total = entry.byte_size as u64;
        self.inner.seek(SeekFrom::Start(block_offset(entry.starting_block)))?;
        let mut done = 0u64;
        while done < total {
            let want  = chunk_len(total, done);
            let chunk = self.buf.slice(want);
            let got   = read_full(&mut self.inner, chunk)?;
            out.write_all(&chunk[..got])?;
            done += got as u64;
            if got < want {
                return Err(StoreError::ShortRead { expected: total, actual: done });
            }
        }
        Ok(done)
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Read + Write + Seek> Container<F> {
    /// Write a fresh container: an empty Table followed by a new Header.
    /// The Block Store starts out empty.
    pub fn init(mut inner: F) -> io::Result<Self> {
        let table  = Table::new();
        let header = Header::new();
        inner.seek(SeekFrom::Start(0))?;
        table.save(&mut inner)?;
        header.write(&mut inner)?;
        Ok(Self { inner, header, table, buf: ChunkBuf::new() })
    }

    /// Persist the whole in-memory Table at offset 0.
    pub fn save_table(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.table.save(&mut self.inner)?;
        self.inner.flush()
    }

    /// Stream exactly `size` bytes from `src` into the store at
    /// `starting_block`.  Returns [`StoreError::ShortRead`] if `src` runs dry
    /// first; bytes already written stay where they landed.
    pub fn write_data<R: Read>(&mut self, starting_block: u32, size: u64, mut src: R) -> Result<(), StoreError> {
        self.inner.seek(SeekFrom::Start(block_offset(starting_block)))?;
        let mut done = 0u64;
        while done < size {
            let want  = chunk_len(size, done);
            let chunk = self.buf.slice(want);
            let got   = read_full(&mut src, chunk)?;
            self.inner.write_all(&chunk[..got])?;
            done += got as u64;
            if got < want {
                return Err(StoreError::ShortRead { expected: size, actual: done });
            }
        }
        Ok(())
    }

    /// Move payload bytes to match a compacted Table.
    ///
    /// `moves` must be ordered by ascending source with every destination at
    /// or below its source, as [`Table::compact`] produces them.  Within one
    /// move, chunks go low to high, so a chunk is always read before any
    /// write can reach it.
    pub fn relocate(&mut self, moves: &[Relocation]) -> Result<(), StoreError> {
        for mv in moves {
            if mv.to_block > mv.from_block {
                return Err(StoreError::UpwardMove { from_block: mv.from_block, to_block: mv.to_block });
            }
            let total = mv.byte_size as u64;
            let from  = block_offset(mv.from_block);
            let to    = block_offset(mv.to_block);
            let mut done = 0u64;
            while done < total {
                let want  = chunk_len(total, done);
                let chunk = self.buf.slice(want);
                self.inner.seek(SeekFrom::Start(from + done))?;
                let got = read_full(&mut self.inner, chunk)?;
                if got < want {
                    return Err(StoreError::ShortRead { expected: total, actual: done + got as u64 });
                }
                self.inner.seek(SeekFrom::Start(to + done))?;
                self.inner.write_all(chunk)?;
                done += want as u64;
            }
        }
        Ok(())
    }
}

impl<F: Storage> Container<F> {
    /// Cut the container right after the last live payload byte.  Never grows it.
    pub fn trim(&mut self) -> io::Result<u64> {
        let end = self
            .table
            .occupied()
            .map(|(_, e)| data_end(e.starting_block, e.byte_size))
            .max()
            .unwrap_or(STORE_OFFSET);
        let len = self.len()?;
        if end < len {
            self.inner.set_len(end)?;
            return Ok(len - end);
        }
        Ok(0)
    }
}

/// Read until `buf` is full or the source is exhausted.
fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0)  => break,
            Ok(n)  => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
