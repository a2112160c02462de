//! Table-versus-store consistency scanner.
//!
//! # What is checked
//!
//! Every occupied slot receives an [`EntryHealth`]:
//! - `Healthy` — block count matches the byte size and every payload byte
//!   is present in the container
//! - `BadBlockCount` — `num_blocks` disagrees with `ceil(file_size / BLOCK_SIZE)`
//! - `Truncated` — the container ends before the entry's last byte, as left
//!   behind by an interrupted append
//!
//! Table-wide, the scan reports pairs of slots with overlapping block ranges
//! and names held by more than one slot.  The scan never writes.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::io::{self, Read, Seek};

use crate::block::blocks_for;
use crate::store::Container;
use crate::table::{EntryName, TableEntry};

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryHealth {
    Healthy,
    BadBlockCount { recorded: u32, expected: u64 },
    Truncated { declared: u64, available: u64 },
}

impl EntryHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, EntryHealth::Healthy)
    }
}

/// Verdict for one occupied slot.
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub slot:   usize,
    pub entry:  TableEntry,
    pub health: EntryHealth,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub entries:       Vec<ScannedEntry>,
    /// Slot pairs whose block ranges intersect.
    pub overlaps:      Vec<(usize, usize)>,
    /// Names that more than one slot claims.
    pub duplicates:    Vec<EntryName>,
    pub container_len: u64,
    /// Creation time from the Header, when the writer recorded one.
    pub created_at:    Option<DateTime<Utc>>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.overlaps.is_empty()
            && self.duplicates.is_empty()
            && self.entries.iter().all(|e| e.health.is_healthy())
    }

    /// Summary line for display.
    pub fn summary(&self) -> String {
        let healthy = self.entries.iter().filter(|e| e.health.is_healthy()).count();
        let mut line = format!(
            "{}/{} entries healthy, {} overlap(s), {} duplicate name(s), {} bytes",
            healthy,
            self.entries.len(),
            self.overlaps.len(),
            self.duplicates.len(),
            self.container_len,
        );
        if let Some(at) = self.created_at {
            line.push_str(&format!(", created {at}"));
        }
        line
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

pub fn check<F: Read + Seek>(c: &mut Container<F>) -> io::Result<CheckReport> {
    let container_len = c.len()?;
    let live: Vec<(usize, TableEntry)> = c.table.occupied().map(|(i, e)| (i, e.clone())).collect();

    let mut entries = Vec::with_capacity(live.len());
    let mut seen: BTreeMap<EntryName, usize> = BTreeMap::new();
    for (slot, entry) in live {
        *seen.entry(entry.name.clone()).or_default() += 1;

        let expected  = blocks_for(entry.byte_size as u64);
        let available = c.available(&entry)?;
        let health = if expected != entry.block_count as u64 {
            EntryHealth::BadBlockCount { recorded: entry.block_count, expected }
        } else if available < entry.byte_size as u64 {
            EntryHealth::Truncated { declared: entry.byte_size as u64, available }
        } else {
            EntryHealth::Healthy
        };
        entries.push(ScannedEntry { slot, entry, health });
    }

    Ok(CheckReport {
        entries,
        overlaps: c.table.overlapping(),
        duplicates: seen.into_iter().filter(|&(_, n)| n > 1).map(|(name, _)| name).collect(),
        container_len,
        created_at: c
            .header
            .created_at()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn flags_truncation_and_overlap() {
        let mut c = Container::init(Cursor::new(Vec::new())).unwrap();
        c.write_data(0, 10, &[1u8; 10][..]).unwrap();
        c.table.set(0, TableEntry::new(EntryName::new("a").unwrap(), 0, 10));
        c.table.set(1, TableEntry::new(EntryName::new("b").unwrap(), 0, 20));

        let report = check(&mut c).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.entries[0].health, EntryHealth::Healthy);
        assert_eq!(
            report.entries[1].health,
            EntryHealth::Truncated { declared: 20, available: 10 }
        );
        assert_eq!(report.overlaps, vec![(0, 1)]);
    }

    #[test]
    fn flags_block_count_and_duplicates() {
        let mut c = Container::init(Cursor::new(Vec::new())).unwrap();
        let mut bad = TableEntry::new(EntryName::new("a").unwrap(), 0, 0);
        bad.block_count = 3;
        c.table.set(0, bad);
        c.table.set(1, TableEntry::new(EntryName::new("a").unwrap(), 3, 0));

        let report = check(&mut c).unwrap();
        assert_eq!(
            report.entries[0].health,
            EntryHealth::BadBlockCount { recorded: 3, expected: 0 }
        );
        assert_eq!(report.duplicates, vec![EntryName::new("a").unwrap()]);
        assert!(report.overlaps.is_empty());
    }

    #[test]
    fn reports_creation_time() {
        let mut c = Container::init(Cursor::new(Vec::new())).unwrap();
        let report = check(&mut c).unwrap();
        let at = report.created_at.unwrap();
        assert!((Utc::now() - at).num_seconds() < 60);
        assert!(report.summary().contains(", created "));

        c.header.modification_time = [0; 12];
        let report = check(&mut c).unwrap();
        assert_eq!(report.created_at, None);
        assert!(report.summary().ends_with(" bytes"));
    }
}
