//! Database file header.
//!
//! The first 100 bytes of the file identify the format version and carry
//! the head of the on-disk free-page list:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    version tag, ASCII, zero-padded
//! 16      4     free-page list head (NULLPTR = none)
//! 20      80    reserved, zero
//! ```

use crate::error::{Result, StorageError};
use crate::page::layout::{
    decode_page_ref, encode_page_ref, FILE_HEADER_FREE_PAGE_HEAD_OFFSET, FILE_HEADER_SIZE,
    FILE_HEADER_VERSION_OFFSET, FILE_HEADER_VERSION_SIZE, FILE_HEADER_VERSION_TAG,
};
use crate::types::PageId;

/// Parsed file header
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHeader {
    /// First page of the on-disk free-page list
    pub free_list_head: Option<PageId>,
}

impl FileHeader {
    /// Header for a fresh database: no free pages
    pub fn new() -> Self {
        Self {
            free_list_head: None,
        }
    }

    /// Parse and validate a header read from the start of the file
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StorageError::invalid_db(format!(
                "file header truncated at {} bytes",
                bytes.len()
            )));
        }

        let version =
            &bytes[FILE_HEADER_VERSION_OFFSET..FILE_HEADER_VERSION_OFFSET + FILE_HEADER_VERSION_SIZE];
        if &version[..FILE_HEADER_VERSION_TAG.len()] != FILE_HEADER_VERSION_TAG
            || version[FILE_HEADER_VERSION_TAG.len()..].iter().any(|&b| b != 0)
        {
            return Err(StorageError::invalid_db(format!(
                "unrecognized version tag {:?}",
                String::from_utf8_lossy(version)
            )));
        }

        let head_word = u32::from_le_bytes([
            bytes[FILE_HEADER_FREE_PAGE_HEAD_OFFSET],
            bytes[FILE_HEADER_FREE_PAGE_HEAD_OFFSET + 1],
            bytes[FILE_HEADER_FREE_PAGE_HEAD_OFFSET + 2],
            bytes[FILE_HEADER_FREE_PAGE_HEAD_OFFSET + 3],
        ]);

        Ok(Self {
            free_list_head: decode_page_ref(head_word),
        })
    }

    /// Serialize into a 100-byte header image
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..FILE_HEADER_SIZE].fill(0);
        bytes[FILE_HEADER_VERSION_OFFSET..FILE_HEADER_VERSION_OFFSET + FILE_HEADER_VERSION_TAG.len()]
            .copy_from_slice(FILE_HEADER_VERSION_TAG);
        bytes[FILE_HEADER_FREE_PAGE_HEAD_OFFSET..FILE_HEADER_FREE_PAGE_HEAD_OFFSET + 4]
            .copy_from_slice(&encode_page_ref(self.free_list_head).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            free_list_head: Some(PageId::new(17)),
        };

        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        header.write(&mut bytes);

        let restored = FileHeader::read(&bytes).unwrap();
        assert_eq!(restored.free_list_head, Some(PageId::new(17)));
    }

    #[test]
    fn test_empty_free_list() {
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        FileHeader::new().write(&mut bytes);

        let restored = FileHeader::read(&bytes).unwrap();
        assert_eq!(restored.free_list_head, None);
    }

    #[test]
    fn test_invalid_version_tag() {
        let mut bytes = vec![0u8; FILE_HEADER_SIZE];
        FileHeader::new().write(&mut bytes);
        bytes[0] = b'X';

        assert!(FileHeader::read(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header() {
        assert!(FileHeader::read(&[0u8; 10]).is_err());
    }
}
