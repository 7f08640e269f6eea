//! Error types for the storage engine.

use crate::types::PageId;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine.
///
/// `Io`, `InvalidDatabaseFile`, `Corruption` and `PageOutOfBounds` are fatal
/// to the engine instance: once one is returned the file may no longer be
/// mutated safely. `DuplicateKey`, `CellTooLarge` and `InvalidCell` are
/// ordinary rejections that leave all state untouched.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database file has an invalid header or length
    #[error("Invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// On-disk or in-memory structure violates the format
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Page number is beyond the hard page bound
    #[error("Page {page_num} out of bounds (max pages: {max})")]
    PageOutOfBounds { page_num: PageId, max: usize },

    /// Key already present in the tree
    #[error("Duplicate key")]
    DuplicateKey,

    /// Cell cannot fit inside a single leaf page
    #[error("Cell too large: {size} bytes (max: {max})")]
    CellTooLarge { size: usize, max: usize },

    /// Cell bytes do not match the documented prefix format
    #[error("Invalid cell: {0}")]
    InvalidCell(String),

    /// A table with this name is already registered
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// No table with this name is registered
    #[error("Table not found: {0}")]
    TableNotFound(String),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid database file error
    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }

    /// Create an invalid cell error
    pub fn invalid_cell(msg: impl Into<String>) -> Self {
        Self::InvalidCell(msg.into())
    }
}
