//! Internal (routing) node layout.
//!
//! The body is a packed array of fixed-size `[child page][key]` cells in key
//! order, where each key is the max key of the child's subtree. The right
//! child routes keys strictly greater than the last inner key; it has no key
//! of its own, so a separate flag distinguishes an empty node from a unary
//! node whose only child is the right child.

use crate::page::layout::{
    decode_page_ref, encode_page_ref, INTERNAL_NODE_CELL_SIZE, INTERNAL_NODE_CHILD_SIZE,
    INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET, INTERNAL_NODE_HEADER_SIZE,
    INTERNAL_NODE_NUM_KEYS_OFFSET, INTERNAL_NODE_RIGHT_CHILD_OFFSET, NULLPTR,
};
use crate::page::{NodeType, PageBuf};
use crate::types::PageId;

/// Typed accessors over a page buffer holding an internal node
pub struct InternalNode<'a> {
    page: &'a mut PageBuf,
}

impl<'a> InternalNode<'a> {
    pub fn new(page: &'a mut PageBuf) -> Self {
        Self { page }
    }

    /// Write a fresh, empty internal header onto `page`
    pub fn init(page: &mut PageBuf, is_root: bool, parent: PageId) {
        page.set_node_type(NodeType::Internal);
        page.set_is_root(is_root);
        page.set_parent(parent);
        page.write_word(INTERNAL_NODE_NUM_KEYS_OFFSET, 0);
        page.write_word(INTERNAL_NODE_RIGHT_CHILD_OFFSET, NULLPTR);
        page.write_word(INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET, 0);
    }

    pub fn num_keys(&self) -> usize {
        self.page.read_word(INTERNAL_NODE_NUM_KEYS_OFFSET) as usize
    }

    pub fn set_num_keys(&mut self, num_keys: usize) {
        self.page.write_word(INTERNAL_NODE_NUM_KEYS_OFFSET, num_keys as u32);
    }

    pub fn has_right_child(&self) -> bool {
        self.page.read_word(INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET) != 0
    }

    pub fn set_has_right_child(&mut self, has_right_child: bool) {
        self.page
            .write_word(INTERNAL_NODE_HAS_RIGHT_CHILD_OFFSET, has_right_child as u32);
    }

    pub fn right_child(&self) -> Option<PageId> {
        if !self.has_right_child() {
            return None;
        }
        decode_page_ref(self.page.read_word(INTERNAL_NODE_RIGHT_CHILD_OFFSET))
    }

    pub fn set_right_child(&mut self, child: PageId) {
        self.set_has_right_child(true);
        self.page
            .write_word(INTERNAL_NODE_RIGHT_CHILD_OFFSET, encode_page_ref(Some(child)));
    }

    /// Total child count, counting the right child when present
    pub fn num_children(&self) -> usize {
        self.num_keys() + self.has_right_child() as usize
    }

    fn cell_offset(cell_num: usize) -> usize {
        INTERNAL_NODE_HEADER_SIZE + cell_num * INTERNAL_NODE_CELL_SIZE
    }

    /// Page number of the inner child at `cell_num`
    pub fn child(&self, cell_num: usize) -> PageId {
        PageId::new(self.page.read_word(Self::cell_offset(cell_num)))
    }

    pub fn set_child(&mut self, cell_num: usize, child: PageId) {
        self.page.write_word(Self::cell_offset(cell_num), child.value());
    }

    /// Key of the inner cell at `cell_num` (the max key of that child's
    /// subtree)
    pub fn key(&self, cell_num: usize) -> u32 {
        self.page
            .read_word(Self::cell_offset(cell_num) + INTERNAL_NODE_CHILD_SIZE)
    }

    pub fn set_key(&mut self, cell_num: usize, key: u32) {
        self.page
            .write_word(Self::cell_offset(cell_num) + INTERNAL_NODE_CHILD_SIZE, key);
    }

    /// Raw bytes of the inner cells from `cell_num` through the last one
    pub fn cells_from(&self, cell_num: usize) -> Vec<u8> {
        let start = Self::cell_offset(cell_num);
        let end = Self::cell_offset(self.num_keys());
        self.page.as_bytes()[start.min(end)..end].to_vec()
    }

    /// Bulk-write inner cells starting at `cell_num`
    pub fn write_cells_at(&mut self, cell_num: usize, cells: &[u8]) {
        let start = Self::cell_offset(cell_num);
        self.page.as_bytes_mut()[start..start + cells.len()].copy_from_slice(cells);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_internal() -> PageBuf {
        let mut page = PageBuf::new();
        InternalNode::init(&mut page, false, PageId::new(3));
        page
    }

    #[test]
    fn test_init_is_empty() {
        let mut page = fresh_internal();
        let node = InternalNode::new(&mut page);
        assert_eq!(node.num_keys(), 0);
        assert!(!node.has_right_child());
        assert_eq!(node.right_child(), None);
        assert_eq!(node.num_children(), 0);
    }

    #[test]
    fn test_cells_and_right_child() {
        let mut page = fresh_internal();
        let mut node = InternalNode::new(&mut page);

        node.set_child(0, PageId::new(4));
        node.set_key(0, 100);
        node.set_child(1, PageId::new(5));
        node.set_key(1, 200);
        node.set_num_keys(2);
        node.set_right_child(PageId::new(6));

        assert_eq!(node.child(0), PageId::new(4));
        assert_eq!(node.key(0), 100);
        assert_eq!(node.child(1), PageId::new(5));
        assert_eq!(node.key(1), 200);
        assert_eq!(node.right_child(), Some(PageId::new(6)));
        assert_eq!(node.num_children(), 3);
    }

    #[test]
    fn test_bulk_cell_shift() {
        let mut page = fresh_internal();
        let mut node = InternalNode::new(&mut page);

        for i in 0..3 {
            node.set_child(i, PageId::new(10 + i as u32));
            node.set_key(i, 100 * (i as u32 + 1));
        }
        node.set_num_keys(3);

        // shift cells 1.. right by one slot
        let tail = node.cells_from(1);
        node.write_cells_at(2, &tail);
        node.set_num_keys(4);

        assert_eq!(node.child(2), PageId::new(11));
        assert_eq!(node.key(2), 200);
        assert_eq!(node.child(3), PageId::new(12));
        assert_eq!(node.key(3), 300);
    }

    #[test]
    fn test_unary_node() {
        let mut page = fresh_internal();
        let mut node = InternalNode::new(&mut page);
        node.set_right_child(PageId::new(8));

        assert_eq!(node.num_keys(), 0);
        assert_eq!(node.num_children(), 1);
        assert_eq!(node.right_child(), Some(PageId::new(8)));
    }
}
