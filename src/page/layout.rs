//! On-disk format constants.
//!
//! Single source of truth for the wire format: file header, node headers,
//! cell prefix and free-block layout. All integers on disk are 4-byte
//! little-endian words. None of these values may change once a database
//! file has been created.
//!
//! File layout:
//! ```text
//! [file header (100 B)] [page 0] [page 1] ... [page N-1]
//! ```
//!
//! Every page is a node of one of two kinds, discriminated by the first
//! word. Both start with the common header:
//! ```text
//! Offset  Size  Description
//! 0       4     node type (1 = internal, 2 = leaf)
//! 4       4     is_root flag (0/1)
//! 8       4     parent page number (self-reference on the root)
//! ```

use crate::types::PageId;

/// Size of one page in bytes
pub const PAGE_SIZE: usize = 4096;

/// Size of an on-disk integer
pub const WORD: usize = 4;

/// Null value for any page-number or offset field inside a page body
pub const NULLPTR: u32 = 0;

// File header. The version tag is ASCII, zero-padded to 16 bytes; the rest
// of the header past the free-list head is reserved and zeroed.
pub const FILE_HEADER_SIZE: usize = 100;
pub const FILE_HEADER_VERSION_OFFSET: usize = 0;
pub const FILE_HEADER_VERSION_SIZE: usize = 16;
pub const FILE_HEADER_VERSION_TAG: &[u8] = b"learndb v1";
pub const FILE_HEADER_FREE_PAGE_HEAD_OFFSET: usize = 16;

/// A page on the file-level free list stores the next free page number in
/// its first word.
pub const FREE_PAGE_NEXT_OFFSET: usize = 0;

// Common node header
pub const NODE_TYPE_OFFSET: usize = 0;
pub const IS_ROOT_OFFSET: usize = WORD;
pub const PARENT_POINTER_OFFSET: usize = 2 * WORD;
pub const COMMON_NODE_HEADER_SIZE: usize = 3 * WORD;

// Internal node body:
// ```text
// 12      4     num_keys
// 16      4     right child page number
// 20      4     has_right_child flag (0/1)
// 24      ...   packed cells of [child page number][key]
// ```
pub const INTERNAL_NODE_NUM_KEYS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
pub const INTERNAL_NODE_RIGHT_CHILD_OFFSET: usize = INTERNAL_NODE_NUM_KEYS_OFFSET + WORD;
pub const INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET: usize = INTERNAL_NODE_RIGHT_CHILD_OFFSET + WORD;
pub const INTERNAL_NODE_HEADER_SIZE: usize = INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET + WORD;

pub const INTERNAL_NODE_CHILD_SIZE: usize = WORD;
pub const INTERNAL_NODE_KEY_SIZE: usize = WORD;
pub const INTERNAL_NODE_CELL_SIZE: usize = INTERNAL_NODE_CHILD_SIZE + INTERNAL_NODE_KEY_SIZE;

// Leaf node body:
// ```text
// 12      4     num_cells
// 16      4     alloc_ptr (one past the lowest allocated cell byte)
// 20      4     free list head offset (NULLPTR = empty)
// 24      4     total bytes across all free blocks
// 28      ...   cell pointer array, one word per cell, sorted by cell key
// ...
// [alloc_ptr..PAGE_SIZE) cells, unordered in storage
// ```
pub const LEAF_NODE_NUM_CELLS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
pub const LEAF_NODE_ALLOC_POINTER_OFFSET: usize = LEAF_NODE_NUM_CELLS_OFFSET + WORD;
pub const LEAF_NODE_FREE_LIST_HEAD_OFFSET: usize = LEAF_NODE_ALLOC_POINTER_OFFSET + WORD;
pub const LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET: usize = LEAF_NODE_FREE_LIST_HEAD_OFFSET + WORD;
pub const LEAF_NODE_HEADER_SIZE: usize = LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET + WORD;

pub const LEAF_NODE_CELL_POINTER_START: usize = LEAF_NODE_HEADER_SIZE;
pub const LEAF_NODE_CELL_POINTER_SIZE: usize = WORD;

/// Space on a leaf available to cells and cell pointers
pub const LEAF_NODE_NON_HEADER_SPACE: usize = PAGE_SIZE - LEAF_NODE_HEADER_SIZE;

/// Largest cell that fits on an otherwise empty leaf, accounting for its
/// cell pointer. Cells never overflow to other pages.
pub const LEAF_NODE_MAX_CELL_SIZE: usize = LEAF_NODE_NON_HEADER_SPACE - LEAF_NODE_CELL_POINTER_SIZE;

// Leaf cell prefix: `[key_size][data_size][key bytes][data bytes]`
pub const CELL_KEY_SIZE_OFFSET: usize = 0;
pub const CELL_DATA_SIZE_OFFSET: usize = WORD;
pub const CELL_PAYLOAD_OFFSET: usize = 2 * WORD;
pub const CELL_HEADER_SIZE: usize = 2 * WORD;

/// Keys are fixed-width unsigned integers
pub const CELL_KEY_SIZE: usize = WORD;

// Free block, formatted in place over a freed cell:
// `[block_size][next free block offset]`
pub const FREE_BLOCK_SIZE_OFFSET: usize = 0;
pub const FREE_BLOCK_NEXT_OFFSET: usize = WORD;
pub const FREE_BLOCK_HEADER_SIZE: usize = 2 * WORD;

/// Encode an optional page reference for a page-body field
pub fn encode_page_ref(page: Option<PageId>) -> u32 {
    match page {
        Some(p) => p.value(),
        None => NULLPTR,
    }
}

/// Decode a page-body field into an optional page reference
pub fn decode_page_ref(word: u32) -> Option<PageId> {
    if word == NULLPTR {
        None
    } else {
        Some(PageId::new(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(COMMON_NODE_HEADER_SIZE, 12);
        assert_eq!(INTERNAL_NODE_HEADER_SIZE, 24);
        assert_eq!(LEAF_NODE_HEADER_SIZE, 28);
        assert_eq!(LEAF_NODE_CELL_POINTER_START, 28);
        assert_eq!(LEAF_NODE_NON_HEADER_SPACE, 4068);
    }

    #[test]
    fn test_version_tag_fits_field() {
        assert!(FILE_HEADER_VERSION_TAG.len() <= FILE_HEADER_VERSION_SIZE);
    }

    #[test]
    fn test_page_ref_roundtrip() {
        assert_eq!(encode_page_ref(None), NULLPTR);
        assert_eq!(decode_page_ref(NULLPTR), None);
        assert_eq!(decode_page_ref(encode_page_ref(Some(PageId::new(7)))), Some(PageId::new(7)));
    }
}
