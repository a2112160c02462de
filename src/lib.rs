pub mod block;
pub mod header;
pub mod table;
pub mod store;
pub mod archive;
pub mod recovery;

pub use block::{BLOCK_SIZE, STORE_OFFSET};
pub use header::Header;
pub use table::{EntryName, Slot, Table, TableEntry, TABLE_SLOTS};
pub use archive::{Archive, ArchiveError, ArchiveOptions, CommitMode, Verbosity};
