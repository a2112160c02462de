//! The allocation table: 256 fixed-position slots at container offset 0.
//!
//! # Record layout
//! Each slot is a 28-byte little-endian record:
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 12   | `filename` (NUL-padded) |
//! | 12     | 4    | `starting_block` |
//! | 16     | 4    | `num_blocks`     |
//! | 20     | 4    | `file_size`      |
//! | 24     | 1    | `is_empty`       |
//! | 25     | 3    | padding (zero)   |
//!
//! The table is always read and written whole.  Slot position is allocation
//! bookkeeping only and says nothing about where a file's blocks live.

mod name;

pub use name::{EntryName, NameError, MAX_NAME_LEN, NAME_FIELD};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::block::blocks_for;

/// Number of slots in a table.
pub const TABLE_SLOTS: usize = 256;
/// On-disk size of one slot record.
pub const ENTRY_SIZE: usize = 28;
/// On-disk size of the whole table.
pub const TABLE_SIZE: usize = TABLE_SLOTS * ENTRY_SIZE;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("slot {slot}: {source}")]
    Name { slot: usize, source: NameError },
    #[error("slot {slot}: records {recorded} blocks, {expected} needed for its size")]
    BadBlockCount { slot: usize, recorded: u32, expected: u64 },
    #[error("slots {first} and {second} claim the same blocks")]
    Overlap { first: usize, second: usize },
    #[error("live blocks exceed the addressable range")]
    BlockOverflow,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A live file: where its blocks start, how many it spans, its exact length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub name:           EntryName,
    pub starting_block: u32,
    pub block_count:    u32,
    pub byte_size:      u32,
}

impl TableEntry {
    pub fn new(name: EntryName, starting_block: u32, byte_size: u32) -> Self {
        Self {
            name,
            starting_block,
            block_count: blocks_for(byte_size as u64) as u32,
            byte_size,
        }
    }

    /// One past the last block this entry owns.
    pub fn end_block(&self) -> u64 {
        self.starting_block as u64 + self.block_count as u64
    }

    pub fn overlaps(&self, other: &TableEntry) -> bool {
        (self.starting_block as u64) < other.end_block()
            && (other.starting_block as u64) < self.end_block()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Empty,
    Occupied(TableEntry),
}

impl Slot {
    pub fn entry(&self) -> Option<&TableEntry> {
        match self {
            Slot::Occupied(e) => Some(e),
            Slot::Empty       => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

/// One byte range the Block Store has to move to honour a compacted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from_block: u32,
    pub to_block:   u32,
    pub byte_size:  u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    slots: Vec<Slot>,
}

impl Table {
    pub fn new() -> Self {
        Self { slots: vec![Slot::Empty; TABLE_SLOTS] }
    }

    // ── Codec ────────────────────────────────────────────────────────────────

    /// Read exactly [`TABLE_SIZE`] bytes.  A short read is an error.
    pub fn load<R: Read>(mut reader: R) -> Result<Self, TableError> {
        let mut raw = vec![0u8; TABLE_SIZE];
        reader.read_exact(&mut raw)?;
        Self::decode(&raw)
    }

    /// Write all 256 slots, every time.
    pub fn save<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let raw = self.encode()?;
        debug_assert_eq!(raw.len(), TABLE_SIZE);
        writer.write_all(&raw)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, TableError> {
        let mut reader = raw;
        let mut slots = Vec::with_capacity(TABLE_SLOTS);
        for slot in 0..TABLE_SLOTS {
            let mut field = [0u8; NAME_FIELD];
            reader.read_exact(&mut field)?;
            let starting_block = reader.read_u32::<LittleEndian>()?;
            let block_count    = reader.read_u32::<LittleEndian>()?;
            let byte_size      = reader.read_u32::<LittleEndian>()?;
            let is_empty       = reader.read_u8()?;
            let mut pad = [0u8; 3];
            reader.read_exact(&mut pad)?;

            if is_empty != 0 {
                slots.push(Slot::Empty);
                continue;
            }
            // A zeroed record with no name is a cleared slot, not a file.
            match EntryName::from_field(&field).map_err(|source| TableError::Name { slot, source })? {
                Some(name) => slots.push(Slot::Occupied(TableEntry {
                    name,
                    starting_block,
                    block_count,
                    byte_size,
                })),
                None => slots.push(Slot::Empty),
            }
        }
        Ok(Self { slots })
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(TABLE_SIZE);
        for slot in &self.slots {
            match slot {
                Slot::Occupied(e) => {
                    raw.write_all(&e.name.to_field())?;
                    raw.write_u32::<LittleEndian>(e.starting_block)?;
                    raw.write_u32::<LittleEndian>(e.block_count)?;
                    raw.write_u32::<LittleEndian>(e.byte_size)?;
                    raw.write_u8(0)?;
                }
                Slot::Empty => {
                    raw.write_all(&[0u8; NAME_FIELD + 12])?;
                    raw.write_u8(1)?;
                }
            }
            raw.write_all(&[0u8; 3])?;
        }
        Ok(raw)
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, slot: usize) -> Option<&TableEntry> {
        self.slots.get(slot).and_then(Slot::entry)
    }

    /// Occupied slots with their positions, in slot order.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &TableEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.entry().map(|e| (i, e)))
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied().count()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.occupied().find(|(_, e)| e.name == *name).map(|(i, _)| i)
    }

    // ── Allocation ───────────────────────────────────────────────────────────

    /// First unoccupied slot in slot order.
    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(Slot::is_empty)
    }

    /// Block right after the highest block any live file uses.
    pub fn next_free_block(&self) -> u64 {
        self.occupied().map(|(_, e)| e.end_block()).max().unwrap_or(0)
    }

    pub fn set(&mut self, slot: usize, entry: TableEntry) {
        self.slots[slot] = Slot::Occupied(entry);
    }

    pub fn entry_mut(&mut self, slot: usize) -> Option<&mut TableEntry> {
        match self.slots.get_mut(slot) {
            Some(Slot::Occupied(e)) => Some(e),
            _                       => None,
        }
    }

    /// Clear a slot.  Its blocks stay in the store until the next pack.
    pub fn tombstone(&mut self, slot: usize) -> Option<TableEntry> {
        match std::mem::replace(&mut self.slots[slot], Slot::Empty) {
            Slot::Occupied(e) => Some(e),
            Slot::Empty       => None,
        }
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Renumber live files so their blocks run contiguously from block 0, in
    /// their current block order, then collapse occupied slots to the front
    /// in slot order.
    ///
    /// Returns the byte moves the Block Store must perform, lowest source
    /// first.  Every destination is at or below its source, so applying them
    /// in order never clobbers bytes that have yet to move.
    ///
    /// Refuses a table whose block counts disagree with the sizes or whose
    /// ranges overlap; the table is left as it was.
    pub fn compact(&mut self) -> Result<Vec<Relocation>, TableError> {
        for (slot, e) in self.occupied() {
            let expected = blocks_for(e.byte_size as u64);
            if e.block_count as u64 != expected {
                return Err(TableError::BadBlockCount { slot, recorded: e.block_count, expected });
            }
        }
        if let Some(&(first, second)) = self.overlapping().first() {
            return Err(TableError::Overlap { first, second });
        }

        let mut by_block: Vec<usize> = self.occupied().map(|(i, _)| i).collect();
        by_block.sort_by_key(|&i| self.slots[i].entry().map(|e| e.starting_block));

        let mut plan = Vec::with_capacity(by_block.len());
        let mut next = 0u32;
        for &i in &by_block {
            if let Some(e) = self.slots[i].entry() {
                plan.push((i, next));
                next = next.checked_add(e.block_count).ok_or(TableError::BlockOverflow)?;
            }
        }

        let mut relocations = Vec::new();
        for (i, to_block) in plan {
            if let Slot::Occupied(e) = &mut self.slots[i] {
                if e.starting_block != to_block {
                    relocations.push(Relocation {
                        from_block: e.starting_block,
                        to_block,
                        byte_size:  e.byte_size,
                    });
                    e.starting_block = to_block;
                }
            }
        }

        let mut live: Vec<Slot> = self.slots.drain(..).filter(|s| !s.is_empty()).collect();
        live.resize(TABLE_SLOTS, Slot::Empty);
        self.slots = live;
        Ok(relocations)
    }

    /// Pairs of slots whose block ranges intersect.
    pub fn overlapping(&self) -> Vec<(usize, usize)> {
        let live: Vec<(usize, &TableEntry)> = self.occupied().collect();
        let mut pairs = Vec::new();
        for (n, (a, ea)) in live.iter().enumerate() {
            for (b, eb) in &live[n + 1..] {
                if ea.overlaps(eb) {
                    pairs.push((*a, *b));
                }
            }
        }
        pairs
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
