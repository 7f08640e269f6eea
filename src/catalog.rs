//! Catalog rows.
//!
//! The catalog is an ordinary B+tree pinned to page 0. Each of its cells
//! describes one user table: the cell key is a monotonically assigned
//! catalog key, and the data bytes are a serialized [`TableRecord`]. The
//! tree layer never looks inside them.

use crate::error::{Result, StorageError};
use crate::page::cell;
use serde::{Deserialize, Serialize};

/// One catalog entry: a table's name, its tree's root page, and the DDL
/// text the schema layer uses to reconstruct its definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableRecord {
    pub name: String,
    pub root_page_num: u32,
    pub sql_text: String,
}

/// Serialize a catalog row into a tree cell
pub fn encode_row(pkey: u32, record: &TableRecord) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(record)
        .map_err(|e| StorageError::corruption(format!("catalog row encode failed: {e}")))?;
    Ok(cell::build_cell(pkey, &data))
}

/// Parse a tree cell back into a catalog row
pub fn decode_row(cell_bytes: &[u8]) -> Result<(u32, TableRecord)> {
    let (pkey, data) = cell::parse_cell(cell_bytes)?;
    let record = serde_json::from_slice(data)
        .map_err(|e| StorageError::corruption(format!("catalog row decode failed: {e}")))?;
    Ok((pkey, record))
}
