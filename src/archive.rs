//! High-level [`Archive`] API: the operations the CLI drives.
//!
//! ```no_run
//! use fatar::archive::{Archive, ArchiveOptions};
//!
//! let ar = Archive::new("out.fat", ArchiveOptions::default());
//! ar.create(&["readme.txt"])?;
//! ar.delete("readme.txt")?;
//! ar.pack()?;
//! # Ok::<(), fatar::archive::ArchiveError>(())
//! ```
//!
//! Every call opens the container, loads the Table, does its work and
//! persists the Table before returning; the handle is closed on every exit
//! path.  Nothing is cached between calls.
//!
//! # Commit modes
//! With [`CommitMode::Staged`] (the default) a mutating call works on a copy
//! of the container in the same directory and renames it over the original
//! only once the Table is persisted, so a failed or interrupted call leaves
//! the original untouched.  [`CommitMode::InPlace`] edits the container
//! directly; precondition failures still happen before any byte is written.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::block::blocks_for;
use crate::header::HeaderError;
use crate::recovery::{self, CheckReport};
use crate::store::{Container, StoreError};
use crate::table::{EntryName, NameError, Table, TableEntry, TableError, TABLE_SLOTS};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("header: {0}")]
    Header(#[from] HeaderError),
    #[error("table: {0}")]
    Table(#[from] TableError),
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("{0}: not found in archive")]
    NotFound(String),
    #[error("table full: all {capacity} slots are occupied")]
    CapacityExceeded { capacity: usize },
    #[error("{name}: replacement needs {actual} blocks, entry holds {expected}")]
    SizeMismatch { name: String, expected: u32, actual: u64 },
    #[error("{name}: expected {expected} bytes, only {actual} available")]
    ShortRead { name: String, expected: u64, actual: u64 },
    #[error("{0}: already in archive")]
    DuplicateName(String),
    #[error("{name}: {size} bytes does not fit an entry")]
    FileTooLarge { name: String, size: u64 },
    #[error("block store has no addressable blocks left")]
    OutOfBlocks,
    #[error("refusing to move block {from_block} up to block {to_block}")]
    UpwardMove { from_block: u32, to_block: u32 },
}

impl ArchiveError {
    /// Attach the entry a short read happened on.
    fn named(self, name: &EntryName) -> Self {
        match self {
            Self::ShortRead { expected, actual, .. } => {
                Self::ShortRead { name: name.to_string(), expected, actual }
            }
            other => other,
        }
    }
}

impl From<StoreError> for ArchiveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Header(e) => Self::Header(e),
            StoreError::Table(e)  => Self::Table(e),
            StoreError::Io(e)     => Self::Io(e),
            StoreError::ShortRead { expected, actual } => {
                Self::ShortRead { name: String::new(), expected, actual }
            }
            StoreError::UpwardMove { from_block, to_block } => {
                Self::UpwardMove { from_block, to_block }
            }
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// How much an operation reports about itself: 0 quiet, 1 per-file
/// progress, 2 and up step-by-step tracing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(pub u8);

impl Verbosity {
    pub fn progress(self) -> bool { self.0 >= 1 }
    pub fn trace(self)    -> bool { self.0 >= 2 }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// Work on a same-directory copy, then rename it over the original.
    #[default]
    Staged,
    /// Edit the container directly.
    InPlace,
}

/// Configuration for an [`Archive`] handle.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub verbosity:  Verbosity,
    pub commit:     CommitMode,
    /// Where [`Archive::extract`] recreates files.
    pub output_dir: PathBuf,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            verbosity:  Verbosity::default(),
            commit:     CommitMode::default(),
            output_dir: PathBuf::from("."),
        }
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// Outcome of create/append: files added, and files skipped with why.
#[derive(Debug, Default)]
pub struct AppendReport {
    pub added:  Vec<TableEntry>,
    pub failed: Vec<(PathBuf, ArchiveError)>,
}

impl AppendReport {
    pub fn is_complete(&self) -> bool { self.failed.is_empty() }
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<TableEntry>,
    pub failed:    Vec<(EntryName, ArchiveError)>,
}

impl ExtractReport {
    pub fn is_complete(&self) -> bool { self.failed.is_empty() }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackReport {
    /// Entries whose payload moved.
    pub relocated:       usize,
    /// Bytes cut from the end of the container.
    pub reclaimed_bytes: u64,
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path: PathBuf,
    opts: ArchiveOptions,
}

impl Archive {
    pub fn new<P: AsRef<Path>>(path: P, opts: ArchiveOptions) -> Self {
        Self { path: path.as_ref().to_owned(), opts }
    }

    // ── Create / append ──────────────────────────────────────────────────────

    /// Write a fresh, empty container, replacing anything at the path, then
    /// add `files` in one pass.  The Table is persisted once at the end.
    pub fn create<P: AsRef<Path>>(&self, files: &[P]) -> Result<AppendReport, ArchiveError> {
        self.trace(format_args!("creating {}", self.path.display()));
        let report = match self.opts.commit {
            CommitMode::InPlace => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)?;
                let mut c = Container::init(file)?;
                let report = self.add_files(&mut c, files);
                c.save_table()?;
                report
            }
            CommitMode::Staged => {
                let staged = NamedTempFile::new_in(self.staging_dir())?;
                let mut c = Container::init(staged.as_file().try_clone()?)?;
                let report = self.add_files(&mut c, files);
                c.save_table()?;
                c.into_inner().sync_all()?;
                staged.persist(&self.path).map_err(|e| e.error)?;
                report
            }
        };
        self.progress(format_args!("created {} with {} file(s)", self.path.display(), report.added.len()));
        Ok(report)
    }

    /// Add `files` after the highest block in use, each into the first free
    /// slot.  A file that fails is reported and skipped; the rest still go in.
    pub fn append<P: AsRef<Path>>(&self, files: &[P]) -> Result<AppendReport, ArchiveError> {
        self.modify(|c| {
            let report = self.add_files(c, files);
            self.trace(format_args!("persisting table"));
            c.save_table()?;
            Ok(report)
        })
    }

    fn add_files<P: AsRef<Path>>(&self, c: &mut Container<File>, files: &[P]) -> AppendReport {
        let mut report = AppendReport::default();
        for path in files {
            let path = path.as_ref();
            match self.add_file(c, path) {
                Ok(entry) => {
                    self.progress(format_args!(
                        "added {}: {} bytes, block {}, {} block(s)",
                        entry.name, entry.byte_size, entry.starting_block, entry.block_count
                    ));
                    report.added.push(entry);
                }
                Err(e) => {
                    warn!("{}: {e}", path.display());
                    report.failed.push((path.to_owned(), e));
                }
            }
        }
        report
    }

    fn add_file(&self, c: &mut Container<File>, path: &Path) -> Result<TableEntry, ArchiveError> {
        let name = EntryName::from_path(path)?;
        if c.table.find(name.as_str()).is_some() {
            return Err(ArchiveError::DuplicateName(name.to_string()));
        }
        let slot = c
            .table
            .first_free()
            .ok_or(ArchiveError::CapacityExceeded { capacity: TABLE_SLOTS })?;

        let src  = File::open(path)?;
        let size = src.metadata()?.len();
        let byte_size = u32::try_from(size)
            .map_err(|_| ArchiveError::FileTooLarge { name: name.to_string(), size })?;
        let starting_block = u32::try_from(c.table.next_free_block())
            .map_err(|_| ArchiveError::OutOfBlocks)?;
        let entry = TableEntry::new(name, starting_block, byte_size);
        if entry.end_block() > u32::MAX as u64 {
            return Err(ArchiveError::OutOfBlocks);
        }

        self.trace(format_args!(
            "{}: slot {slot}, block {starting_block}, {} block(s)",
            entry.name, entry.block_count
        ));
        c.write_data(starting_block, size, src)
            .map_err(|e| ArchiveError::from(e).named(&entry.name))?;
        c.table.set(slot, entry.clone());
        Ok(entry)
    }

    // ── Read side ────────────────────────────────────────────────────────────

    /// The whole Table, read-only.
    pub fn list(&self) -> Result<Table, ArchiveError> {
        let c = self.open_read()?;
        Ok(c.table)
    }

    /// Recreate every live file under `output_dir`.  A file that fails is
    /// abandoned where it failed; the others are still extracted.
    pub fn extract(&self) -> Result<ExtractReport, ArchiveError> {
        let mut c = self.open_read()?;
        let dir = &self.opts.output_dir;
        fs::create_dir_all(dir)?;

        let entries: Vec<TableEntry> = c.table.occupied().map(|(_, e)| e.clone()).collect();
        let mut report = ExtractReport::default();
        for entry in entries {
            self.trace(format_args!("extracting {}", entry.name));
            match extract_one(&mut c, &entry, dir) {
                Ok(()) => {
                    self.progress(format_args!(
                        "extracted {}: {} bytes, block {}, {} block(s)",
                        entry.name, entry.byte_size, entry.starting_block, entry.block_count
                    ));
                    report.extracted.push(entry);
                }
                Err(e) => {
                    warn!("{}: {e}", entry.name);
                    report.failed.push((entry.name, e));
                }
            }
        }
        Ok(report)
    }

    /// Health scan of the container.  Never writes.
    pub fn check(&self) -> Result<CheckReport, ArchiveError> {
        let mut c = self.open_read()?;
        Ok(recovery::check(&mut c)?)
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Clear the slot named `name`.  Its blocks stay in the store until the
    /// next [`pack`](Self::pack).
    pub fn delete(&self, name: &str) -> Result<TableEntry, ArchiveError> {
        self.modify(|c| {
            let entry = c
                .table
                .find(name)
                .and_then(|slot| c.table.tombstone(slot))
                .ok_or_else(|| ArchiveError::NotFound(name.to_owned()))?;
            c.save_table()?;
            self.progress(format_args!("deleted {name}"));
            Ok(entry)
        })
    }

    /// Overwrite an entry's blocks with the current contents of the file at
    /// `path`, matched by file name.  The replacement must span the same
    /// number of blocks; entries are never moved or resized here.
    pub fn update<P: AsRef<Path>>(&self, path: P) -> Result<TableEntry, ArchiveError> {
        let path = path.as_ref();
        let name = EntryName::from_path(path)?;
        self.modify(|c| {
            let slot = c
                .table
                .find(name.as_str())
                .ok_or_else(|| ArchiveError::NotFound(name.to_string()))?;
            let (starting_block, block_count) = match c.table.get(slot) {
                Some(e) => (e.starting_block, e.block_count),
                None    => return Err(ArchiveError::NotFound(name.to_string())),
            };

            let src  = File::open(path)?;
            let size = src.metadata()?.len();
            let needed = blocks_for(size);
            if needed != block_count as u64 {
                return Err(ArchiveError::SizeMismatch {
                    name:     name.to_string(),
                    expected: block_count,
                    actual:   needed,
                });
            }
            let byte_size = u32::try_from(size)
                .map_err(|_| ArchiveError::FileTooLarge { name: name.to_string(), size })?;

            self.trace(format_args!("{name}: rewriting {block_count} block(s) at block {starting_block}"));
            c.write_data(starting_block, size, src)
                .map_err(|e| ArchiveError::from(e).named(&name))?;

            let updated = match c.table.entry_mut(slot) {
                Some(e) => {
                    e.byte_size = byte_size;
                    e.clone()
                }
                None => return Err(ArchiveError::NotFound(name.to_string())),
            };
            c.save_table()?;
            self.progress(format_args!("updated {name}: {byte_size} bytes"));
            Ok(updated)
        })
    }

    /// Close the gaps deletions left: live payload moves down to run
    /// contiguously from block 0, occupied slots collapse to the front, and
    /// the container is cut after the last live byte.
    ///
    /// A table with overlapping ranges or block counts that disagree with
    /// the sizes is refused before anything moves.
    pub fn pack(&self) -> Result<PackReport, ArchiveError> {
        self.modify(|c| {
            let live: Vec<TableEntry> = c.table.occupied().map(|(_, e)| e.clone()).collect();
            for entry in &live {
                let available = c.available(entry)?;
                if available < entry.byte_size as u64 {
                    return Err(ArchiveError::ShortRead {
                        name:     entry.name.to_string(),
                        expected: entry.byte_size as u64,
                        actual:   available,
                    });
                }
            }

            let moves = c.table.compact()?;
            for mv in &moves {
                self.trace(format_args!("moving block {} to block {}", mv.from_block, mv.to_block));
            }
            c.relocate(&moves)?;
            c.save_table()?;
            let reclaimed_bytes = c.trim()?;

            self.progress(format_args!(
                "packed {}: {} entries moved, {reclaimed_bytes} bytes reclaimed",
                self.path.display(),
                moves.len()
            ));
            Ok(PackReport { relocated: moves.len(), reclaimed_bytes })
        })
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    fn open_read(&self) -> Result<Container<File>, ArchiveError> {
        self.trace(format_args!("opening {}", self.path.display()));
        Ok(Container::open(File::open(&self.path)?)?)
    }

    /// Run a mutating operation under the configured [`CommitMode`].
    fn modify<T>(
        &self,
        op: impl FnOnce(&mut Container<File>) -> Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        match self.opts.commit {
            CommitMode::InPlace => {
                let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
                let mut c = Container::open(file)?;
                op(&mut c)
            }
            CommitMode::Staged => {
                let mut original = File::open(&self.path)?;
                let mut staged = NamedTempFile::new_in(self.staging_dir())?;
                io::copy(&mut original, staged.as_file_mut())?;
                staged.as_file().set_permissions(original.metadata()?.permissions())?;
                drop(original);

                let mut c = Container::open(staged.as_file().try_clone()?)?;
                let out = op(&mut c)?;
                c.into_inner().sync_all()?;
                self.trace(format_args!("committing {}", self.path.display()));
                staged.persist(&self.path).map_err(|e| e.error)?;
                Ok(out)
            }
        }
    }

    fn staging_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn progress(&self, args: fmt::Arguments<'_>) {
        if self.opts.verbosity.progress() {
            info!("{args}");
        }
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        if self.opts.verbosity.trace() {
            debug!("{args}");
        }
    }
}

fn extract_one(c: &mut Container<File>, entry: &TableEntry, dir: &Path) -> Result<(), ArchiveError> {
    let mut out = File::create(dir.join(entry.name.as_str()))?;
    c.read_entry(entry, &mut out)
        .map_err(|e| ArchiveError::from(e).named(&entry.name))?;
    Ok(())
}
