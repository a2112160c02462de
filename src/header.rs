use chrono::Utc;
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::block::BLOCK_SIZE;

pub const MAGIC: &[u8; 6] = b"ustar\0";
pub const VERSION: &[u8; 2] = b"00";
/// On-disk size of [`Header`]; it sits right after the Table.
pub const HEADER_SIZE: usize = 507;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Container was written with block size {0}, expected {BLOCK_SIZE}")]
    BlockSizeMismatch(u64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Tar-style identification record, written once by create and never
/// touched again.  Text fields are NUL-padded; numeric fields are octal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub user_name: [u8; 100],
    pub group_name: [u8; 100],
    pub modification_time: [u8; 12],
    pub checksum: [u8; 8],
    pub file_size: [u8; 12],
    pub block_size: [u8; 12],
    pub linked_tar_file: [u8; 100],
    pub prefix: [u8; 155],
}

impl Header {
    /// Header for a container created now.
    pub fn new() -> Self {
        Self {
            magic: *MAGIC,
            version: *VERSION,
            user_name: [0; 100],
            group_name: [0; 100],
            modification_time: octal_field(Utc::now().timestamp().max(0) as u64),
            checksum: [0; 8],
            file_size: [0; 12],
            block_size: octal_field(BLOCK_SIZE as u64),
            linked_tar_file: [0; 100],
            prefix: [0; 155],
        }
    }

    /// Creation time in seconds since the epoch, if recorded.
    pub fn created_at(&self) -> Option<u64> {
        parse_octal(&self.modification_time)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version)?;
        writer.write_all(&self.user_name)?;
        writer.write_all(&self.group_name)?;
        writer.write_all(&self.modification_time)?;
        writer.write_all(&self.checksum)?;
        writer.write_all(&self.file_size)?;
        writer.write_all(&self.block_size)?;
        writer.write_all(&self.linked_tar_file)?;
        writer.write_all(&self.prefix)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, HeaderError> {
        let mut magic = [0u8; 6];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        let mut header = Self {
            magic,
            version: [0; 2],
            user_name: [0; 100],
            group_name: [0; 100],
            modification_time: [0; 12],
            checksum: [0; 8],
            file_size: [0; 12],
            block_size: [0; 12],
            linked_tar_file: [0; 100],
            prefix: [0; 155],
        };
        reader.read_exact(&mut header.version)?;
        reader.read_exact(&mut header.user_name)?;
        reader.read_exact(&mut header.group_name)?;
        reader.read_exact(&mut header.modification_time)?;
        reader.read_exact(&mut header.checksum)?;
        reader.read_exact(&mut header.file_size)?;
        reader.read_exact(&mut header.block_size)?;
        reader.read_exact(&mut header.linked_tar_file)?;
        reader.read_exact(&mut header.prefix)?;

        // Containers from older writers leave the field zeroed.
        if let Some(size) = parse_octal(&header.block_size) {
            if size != BLOCK_SIZE as u64 {
                return Err(HeaderError::BlockSizeMismatch(size));
            }
        }
        Ok(header)
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL-terminated, zero-padded octal text.
fn octal_field<const N: usize>(value: u64) -> [u8; N] {
    let mut field = [0u8; N];
    let text = format!("{value:o}");
    let len = text.len().min(N - 1);
    field[..len].copy_from_slice(&text.as_bytes()[text.len() - len..]);
    field
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|&c| c == b' ')
        .take_while(|c| (b'0'..=b'7').contains(c))
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits
        .iter()
        .try_fold(0u64, |acc, &c| acc.checked_mul(8)?.checked_add((c - b'0') as u64))
}
