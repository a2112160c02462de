use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Width of the on-disk name field, terminator included.
pub const NAME_FIELD: usize = 12;
/// Longest name a slot can hold.
pub const MAX_NAME_LEN: usize = NAME_FIELD - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("empty file name")]
    Empty,
    #[error("file name is {len} bytes, at most {MAX_NAME_LEN} fit in a table slot")]
    TooLong { len: usize },
    #[error("file name contains {0:?}")]
    InvalidChar(char),
    #[error("file name is not valid UTF-8")]
    NotUtf8,
    #[error("{0:?} is not a file name")]
    Reserved(String),
}

/// A flat file name that fits a table slot.  Over-long names are rejected,
/// never truncated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntryName(String);

impl EntryName {
    pub fn new(name: &str) -> Result<Self, NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong { len: name.len() });
        }
        if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
            return Err(NameError::InvalidChar(c));
        }
        if name == "." || name == ".." {
            return Err(NameError::Reserved(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    /// Name stored for a source file: its final path component.
    pub fn from_path(path: &Path) -> Result<Self, NameError> {
        let name = path.file_name().ok_or(NameError::Empty)?;
        Self::new(name.to_str().ok_or(NameError::NotUtf8)?)
    }

    /// Decode a NUL-padded name field.  `None` for an all-NUL field.
    pub fn from_field(field: &[u8; NAME_FIELD]) -> Result<Option<Self>, NameError> {
        let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
        if len == 0 {
            return Ok(None);
        }
        let text = std::str::from_utf8(&field[..len]).map_err(|_| NameError::NotUtf8)?;
        Self::new(text).map(Some)
    }

    pub fn to_field(&self) -> [u8; NAME_FIELD] {
        let mut field = [0u8; NAME_FIELD];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for EntryName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}
