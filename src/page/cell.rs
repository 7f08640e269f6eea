//! Leaf cell prefix codec.
//!
//! A cell is the opaque unit the tree stores:
//! `[key_size: u32][data_size: u32][key bytes][data bytes]`. The engine
//! interprets only the prefix and the fixed-width integer key; the data
//! bytes belong to the caller.

use crate::error::{Result, StorageError};
use crate::page::layout::{
    CELL_DATA_SIZE_OFFSET, CELL_HEADER_SIZE, CELL_KEY_SIZE, CELL_KEY_SIZE_OFFSET,
    CELL_PAYLOAD_OFFSET,
};

fn read_word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Build a cell from a key and opaque data bytes
pub fn build_cell(key: u32, data: &[u8]) -> Vec<u8> {
    let mut cell = Vec::with_capacity(CELL_HEADER_SIZE + CELL_KEY_SIZE + data.len());
    cell.extend((CELL_KEY_SIZE as u32).to_le_bytes());
    cell.extend((data.len() as u32).to_le_bytes());
    cell.extend(key.to_le_bytes());
    cell.extend(data);
    cell
}

/// Parse a caller-supplied cell into its key and data, validating the prefix
pub fn parse_cell(cell: &[u8]) -> Result<(u32, &[u8])> {
    if cell.len() < CELL_HEADER_SIZE + CELL_KEY_SIZE {
        return Err(StorageError::invalid_cell(format!(
            "cell of {} bytes is shorter than its prefix",
            cell.len()
        )));
    }
    let key_size = read_word(cell, CELL_KEY_SIZE_OFFSET) as usize;
    let data_size = read_word(cell, CELL_DATA_SIZE_OFFSET) as usize;
    if key_size != CELL_KEY_SIZE {
        return Err(StorageError::invalid_cell(format!(
            "expected {CELL_KEY_SIZE}-byte key, got {key_size}"
        )));
    }
    if cell.len() != CELL_HEADER_SIZE + key_size + data_size {
        return Err(StorageError::invalid_cell(format!(
            "cell length {} does not match sizes in prefix ({})",
            cell.len(),
            CELL_HEADER_SIZE + key_size + data_size
        )));
    }
    let key = read_word(cell, CELL_PAYLOAD_OFFSET);
    Ok((key, &cell[CELL_PAYLOAD_OFFSET + key_size..]))
}

/// Key of the cell starting at `offset` within a page
pub fn key_at(page: &[u8], offset: usize) -> u32 {
    read_word(page, offset + CELL_PAYLOAD_OFFSET)
}

/// Total size of the cell starting at `offset` within a page
pub fn size_at(page: &[u8], offset: usize) -> usize {
    let key_size = read_word(page, offset + CELL_KEY_SIZE_OFFSET) as usize;
    let data_size = read_word(page, offset + CELL_DATA_SIZE_OFFSET) as usize;
    CELL_HEADER_SIZE + key_size + data_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_roundtrip() {
        let cell = build_cell(42, b"hello");
        assert_eq!(cell.len(), 8 + 4 + 5);

        let (key, data) = parse_cell(&cell).unwrap();
        assert_eq!(key, 42);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_empty_data() {
        let cell = build_cell(7, b"");
        let (key, data) = parse_cell(&cell).unwrap();
        assert_eq!(key, 7);
        assert!(data.is_empty());
    }

    #[test]
    fn test_in_page_accessors() {
        let cell = build_cell(9000, b"payload");
        let mut page = vec![0u8; 256];
        page[100..100 + cell.len()].copy_from_slice(&cell);

        assert_eq!(key_at(&page, 100), 9000);
        assert_eq!(size_at(&page, 100), cell.len());
    }

    #[test]
    fn test_invalid_cells() {
        assert!(parse_cell(b"short").is_err());

        // length disagreeing with the prefix sizes
        let mut cell = build_cell(1, b"abc");
        cell.push(0);
        assert!(parse_cell(&cell).is_err());

        // wrong key width
        let mut cell = build_cell(1, b"abc");
        cell[0] = 8;
        assert!(parse_cell(&cell).is_err());
    }
}
