//! Read-only health scan of a container.
//!
//! See [`scanner`] for what is checked.

pub mod scanner;

pub use scanner::{check, CheckReport, EntryHealth, ScannedEntry};
