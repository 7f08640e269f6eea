//! Slotted leaf node layout.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ common header │ num_cells alloc_ptr free_head free  │
//! ├─────────────────────────────────────────────────────┤
//! │ cell pointer array (sorted by cell key)   →         │
//! ├─────────────────────────────────────────────────────┤
//! │                 allocation block                    │
//! ├─────────────────────────────────────────────────────┤
//! │         ←  cells, unordered in storage              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Cells are placed from the high end of the page downward; `alloc_ptr` is
//! the offset of the lowest allocated cell byte. Key order exists only in
//! the cell-pointer array. Freed cells that cannot be merged back into the
//! allocation block are formatted as free blocks and chained into a
//! singly-linked, unordered intra-page free list whose head and byte total
//! live in the header.

use crate::error::{Result, StorageError};
use crate::page::layout::{
    FREE_BLOCK_HEADER_SIZE, FREE_BLOCK_NEXT_OFFSET, FREE_BLOCK_SIZE_OFFSET,
    LEAF_NODE_ALLOC_POINTER_OFFSET, LEAF_NODE_CELL_POINTER_SIZE, LEAF_NODE_CELL_POINTER_START,
    LEAF_NODE_FREE_LIST_HEAD_OFFSET, LEAF_NODE_NUM_CELLS_OFFSET,
    LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET, NULLPTR, PAGE_SIZE,
};
use crate::page::{cell, NodeType, PageBuf};
use crate::types::PageId;

/// Typed accessors over a page buffer holding a leaf node
pub struct LeafNode<'a> {
    page: &'a mut PageBuf,
}

impl<'a> LeafNode<'a> {
    pub fn new(page: &'a mut PageBuf) -> Self {
        Self { page }
    }

    /// Write a fresh, empty leaf header onto `page`
    pub fn init(page: &mut PageBuf, is_root: bool, parent: PageId) {
        page.set_node_type(NodeType::Leaf);
        page.set_is_root(is_root);
        page.set_parent(parent);
        page.write_word(LEAF_NODE_NUM_CELLS_OFFSET, 0);
        page.write_word(LEAF_NODE_ALLOC_POINTER_OFFSET, PAGE_SIZE as u32);
        page.write_word(LEAF_NODE_FREE_LIST_HEAD_OFFSET, NULLPTR);
        page.write_word(LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET, 0);
    }

    // section: header fields

    pub fn num_cells(&self) -> usize {
        self.page.read_word(LEAF_NODE_NUM_CELLS_OFFSET) as usize
    }

    pub fn set_num_cells(&mut self, num_cells: usize) {
        self.page.write_word(LEAF_NODE_NUM_CELLS_OFFSET, num_cells as u32);
    }

    /// Offset one past the lowest-addressed allocated cell byte
    pub fn alloc_ptr(&self) -> usize {
        self.page.read_word(LEAF_NODE_ALLOC_POINTER_OFFSET) as usize
    }

    pub fn set_alloc_ptr(&mut self, alloc_ptr: usize) {
        self.page.write_word(LEAF_NODE_ALLOC_POINTER_OFFSET, alloc_ptr as u32);
    }

    /// Offset of the first free block, if any
    pub fn free_list_head(&self) -> Option<usize> {
        let word = self.page.read_word(LEAF_NODE_FREE_LIST_HEAD_OFFSET);
        if word == NULLPTR {
            None
        } else {
            Some(word as usize)
        }
    }

    pub fn set_free_list_head(&mut self, head: Option<usize>) {
        let word = match head {
            Some(offset) => offset as u32,
            None => NULLPTR,
        };
        self.page.write_word(LEAF_NODE_FREE_LIST_HEAD_OFFSET, word);
    }

    /// Combined size of every block on the free list
    pub fn total_free_list_bytes(&self) -> usize {
        self.page.read_word(LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET) as usize
    }

    pub fn set_total_free_list_bytes(&mut self, total: usize) {
        self.page.write_word(LEAF_NODE_TOTAL_FREE_LIST_BYTES_OFFSET, total as u32);
    }

    // section: cell pointers and cells

    fn cellptr_offset(cell_num: usize) -> usize {
        LEAF_NODE_CELL_POINTER_START + cell_num * LEAF_NODE_CELL_POINTER_SIZE
    }

    /// Cell-pointer value (cell offset) at position `cell_num`
    pub fn cellptr(&self, cell_num: usize) -> usize {
        self.page.read_word(Self::cellptr_offset(cell_num)) as usize
    }

    pub fn set_cellptr(&mut self, cell_num: usize, offset: usize) {
        self.page.write_word(Self::cellptr_offset(cell_num), offset as u32);
    }

    /// Key of the cell at position `cell_num`
    pub fn key(&self, cell_num: usize) -> u32 {
        cell::key_at(self.page.as_bytes(), self.cellptr(cell_num))
    }

    /// Total size of the cell at position `cell_num`
    pub fn cell_size(&self, cell_num: usize) -> usize {
        cell::size_at(self.page.as_bytes(), self.cellptr(cell_num))
    }

    /// Bytes of the cell at position `cell_num`
    pub fn cell(&self, cell_num: usize) -> &[u8] {
        let offset = self.cellptr(cell_num);
        let size = cell::size_at(self.page.as_bytes(), offset);
        &self.page.as_bytes()[offset..offset + size]
    }

    // section: space accounting

    /// First byte past the cell-pointer array
    pub fn unallocated_start(&self) -> usize {
        Self::cellptr_offset(self.num_cells())
    }

    /// Free bytes in the allocation block, between the cell-pointer array
    /// and `alloc_ptr`
    pub fn alloc_block_space(&self) -> usize {
        self.alloc_ptr().saturating_sub(self.unallocated_start())
    }

    /// Bytes consumed by live cells and their cell pointers
    pub fn used_cell_and_ptr_bytes(&self) -> usize {
        (0..self.num_cells())
            .map(|i| self.cell_size(i) + LEAF_NODE_CELL_POINTER_SIZE)
            .sum()
    }

    // section: allocation

    /// Unlink and return the offset of the first free block with
    /// `block_size >= needed`. Blocks are consumed whole; the byte total
    /// drops by the full block size so it stays the exact sum of the
    /// remaining blocks.
    pub fn take_free_block(&mut self, needed: usize) -> Option<usize> {
        let mut prev: Option<usize> = None;
        let mut current = self.free_list_head();
        while let Some(offset) = current {
            let size = self.free_block_size(offset);
            let next = self.free_block_next(offset);
            if size >= needed {
                match prev {
                    None => self.set_free_list_head(next),
                    Some(prev_offset) => self.set_free_block_next(prev_offset, next),
                }
                self.set_total_free_list_bytes(self.total_free_list_bytes() - size);
                return Some(offset);
            }
            prev = Some(offset);
            current = next;
        }
        None
    }

    /// Carve `size` bytes off the allocation block, returning the offset of
    /// the reservation
    pub fn reserve_alloc_block(&mut self, size: usize) -> Result<usize> {
        if self.alloc_block_space() < size {
            return Err(StorageError::corruption(format!(
                "allocation block has {} bytes, need {}",
                self.alloc_block_space(),
                size
            )));
        }
        let offset = self.alloc_ptr() - size;
        self.set_alloc_ptr(offset);
        Ok(offset)
    }

    /// Copy cell bytes to `offset`
    pub fn write_cell_at(&mut self, offset: usize, cell_bytes: &[u8]) {
        self.page.as_bytes_mut()[offset..offset + cell_bytes.len()].copy_from_slice(cell_bytes);
    }

    /// Insert `offset` into the cell-pointer array at position `cell_num`,
    /// shifting later pointers right, and bump the cell count
    pub fn insert_cellptr(&mut self, cell_num: usize, offset: usize) {
        let num_cells = self.num_cells();
        let start = Self::cellptr_offset(cell_num);
        let end = Self::cellptr_offset(num_cells);
        self.page
            .as_bytes_mut()
            .copy_within(start..end, start + LEAF_NODE_CELL_POINTER_SIZE);
        self.set_cellptr(cell_num, offset);
        self.set_num_cells(num_cells + 1);
    }

    /// Append `cell_bytes` from the allocation block at the end of the
    /// pointer array. Used when rebuilding pages in key order.
    pub fn push_cell(&mut self, cell_bytes: &[u8]) -> Result<()> {
        let offset = self.reserve_alloc_block(cell_bytes.len())?;
        self.write_cell_at(offset, cell_bytes);
        let num_cells = self.num_cells();
        self.set_cellptr(num_cells, offset);
        self.set_num_cells(num_cells + 1);
        Ok(())
    }

    // section: deallocation

    /// Release the storage of the cell at `cell_num`. If the cell sits at
    /// the allocation boundary it is merged back into the allocation block;
    /// otherwise its bytes are formatted as a free block and linked at the
    /// head of the free list. Must run before the cell pointer is removed.
    pub fn deallocate_cell(&mut self, cell_num: usize) {
        let offset = self.cellptr(cell_num);
        let size = self.cell_size(cell_num);

        if offset == self.alloc_ptr() {
            self.set_alloc_ptr(offset + size);
            return;
        }

        self.set_free_block_size(offset, size);
        self.set_free_block_next(offset, self.free_list_head());
        self.set_free_list_head(Some(offset));
        self.set_total_free_list_bytes(self.total_free_list_bytes() + size);
    }

    /// Close the gap at position `cell_num` in the pointer array and drop
    /// the cell count
    pub fn remove_cellptr(&mut self, cell_num: usize) {
        let num_cells = self.num_cells();
        let start = Self::cellptr_offset(cell_num + 1);
        let end = Self::cellptr_offset(num_cells);
        self.page
            .as_bytes_mut()
            .copy_within(start..end, Self::cellptr_offset(cell_num));
        self.set_num_cells(num_cells - 1);
    }

    // section: compaction

    /// Rebuild the page image from its live cells: cells are re-packed from
    /// the high end in pointer order and the free list is reset, turning
    /// every reclaimable byte back into allocation-block space.
    pub fn compact(&mut self) {
        let cells: Vec<Vec<u8>> = (0..self.num_cells()).map(|i| self.cell(i).to_vec()).collect();
        self.set_alloc_ptr(PAGE_SIZE);
        self.set_free_list_head(None);
        self.set_total_free_list_bytes(0);
        for (i, cell_bytes) in cells.iter().enumerate() {
            let offset = self.alloc_ptr() - cell_bytes.len();
            self.write_cell_at(offset, cell_bytes);
            self.set_cellptr(i, offset);
            self.set_alloc_ptr(offset);
        }
    }

    // section: free blocks

    pub fn free_block_size(&self, offset: usize) -> usize {
        self.page.read_word(offset + FREE_BLOCK_SIZE_OFFSET) as usize
    }

    fn set_free_block_size(&mut self, offset: usize, size: usize) {
        self.page.write_word(offset + FREE_BLOCK_SIZE_OFFSET, size as u32);
    }

    pub fn free_block_next(&self, offset: usize) -> Option<usize> {
        let word = self.page.read_word(offset + FREE_BLOCK_NEXT_OFFSET);
        if word == NULLPTR {
            None
        } else {
            Some(word as usize)
        }
    }

    fn set_free_block_next(&mut self, offset: usize, next: Option<usize>) {
        let word = match next {
            Some(next_offset) => next_offset as u32,
            None => NULLPTR,
        };
        self.page.write_word(offset + FREE_BLOCK_NEXT_OFFSET, word);
    }

    /// Walk the free list, returning `(offset, size)` per block. Errors on a
    /// cycle or an out-of-page offset.
    pub fn free_blocks(&self) -> Result<Vec<(usize, usize)>> {
        let mut blocks = Vec::new();
        let mut current = self.free_list_head();
        while let Some(offset) = current {
            if offset >= PAGE_SIZE || blocks.len() > PAGE_SIZE / FREE_BLOCK_HEADER_SIZE {
                return Err(StorageError::corruption(format!(
                    "leaf free list is malformed at offset {offset}"
                )));
            }
            blocks.push((offset, self.free_block_size(offset)));
            current = self.free_block_next(offset);
        }
        Ok(blocks)
    }
}
