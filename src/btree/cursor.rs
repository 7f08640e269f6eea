//! Cursor for ordered traversal.
//!
//! A cursor starts on the leftmost leaf and advances cell by cell in key
//! order. When a leaf is exhausted it climbs the ancestor chain to the
//! nearest ancestor of which the current subtree is not the rightmost
//! child, steps to the next sibling, and descends to its first leaf.

use crate::btree::tree::{ChildSlot, Tree};
use crate::error::{Result, StorageError};
use crate::page::{InternalNode, LeafNode, NodeType};
use crate::storage::Pager;
use crate::types::PageId;

/// Position within a tree, advancing in key order
pub struct Cursor {
    tree: Tree,
    page_num: PageId,
    cell_num: usize,
    at_end: bool,
}

impl Cursor {
    /// Open a cursor on the first cell of the tree
    pub fn new(tree: &Tree) -> Result<Self> {
        let tree = tree.clone();
        let (page_num, cell_num, at_end) = {
            let pager = &mut *tree.pager().write();
            first_leaf(pager, tree.root_page_num())?
        };
        Ok(Self {
            tree,
            page_num,
            cell_num,
            at_end,
        })
    }

    /// Whether the cursor has moved past the last cell
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Key under the cursor
    pub fn key(&self) -> Result<u32> {
        let pager = &mut *self.tree.pager().write();
        Ok(LeafNode::new(pager.page(self.page_num)?).key(self.cell_num))
    }

    /// Bytes of the cell under the cursor
    pub fn cell(&self) -> Result<Vec<u8>> {
        let pager = &mut *self.tree.pager().write();
        Ok(LeafNode::new(pager.page(self.page_num)?)
            .cell(self.cell_num)
            .to_vec())
    }

    /// Step to the next cell in key order
    pub fn advance(&mut self) -> Result<()> {
        if self.at_end {
            return Ok(());
        }
        let tree = self.tree.clone();
        let pager = &mut *tree.pager().write();

        let num_cells = LeafNode::new(pager.page(self.page_num)?).num_cells();
        if self.cell_num + 1 < num_cells {
            self.cell_num += 1;
            return Ok(());
        }
        self.next_leaf(pager)
    }

    /// Move to the first cell of the leaf that follows the current one
    fn next_leaf(&mut self, pager: &mut Pager) -> Result<()> {
        let mut page_num = self.page_num;
        loop {
            if pager.page(page_num)?.is_root() {
                // the current subtree was the rightmost everywhere
                self.at_end = true;
                return Ok(());
            }
            let node_max = match self.tree.node_max_key(pager, page_num)? {
                Some(max) => max,
                None => {
                    self.at_end = true;
                    return Ok(());
                }
            };
            let parent_page = pager.page(page_num)?.parent();
            let slot = self.tree.internal_node_find(pager, parent_page, node_max)?;
            let num_keys = { InternalNode::new(pager.page(parent_page)?).num_keys() };

            let next_child = match slot {
                ChildSlot::Inner(i) if i + 1 == num_keys => {
                    InternalNode::new(pager.page(parent_page)?)
                        .right_child()
                        .ok_or_else(|| {
                            StorageError::corruption(format!(
                                "internal node {parent_page} has no right child"
                            ))
                        })?
                }
                ChildSlot::Inner(i) if i + 1 < num_keys => {
                    InternalNode::new(pager.page(parent_page)?).child(i + 1)
                }
                _ => {
                    // rightmost child of this parent; climb one level
                    page_num = parent_page;
                    continue;
                }
            };

            let (page, cell, end) = first_leaf(pager, next_child)?;
            self.page_num = page;
            self.cell_num = cell;
            self.at_end = end;
            return Ok(());
        }
    }
}

/// Descend to the leftmost leaf under `start`, returning its page, cell 0,
/// and whether that leaf is empty
fn first_leaf(pager: &mut Pager, start: PageId) -> Result<(PageId, usize, bool)> {
    let mut page_num = start;
    loop {
        match pager.page(page_num)?.node_type()? {
            NodeType::Internal => {
                let node = InternalNode::new(pager.page(page_num)?);
                page_num = if node.num_keys() == 0 {
                    node.right_child().ok_or_else(|| {
                        StorageError::corruption(format!(
                            "internal node {page_num} has no children"
                        ))
                    })?
                } else {
                    node.child(0)
                };
            }
            NodeType::Leaf => {
                let num_cells = LeafNode::new(pager.page(page_num)?).num_cells();
                return Ok((page_num, 0, num_cells == 0));
            }
        }
    }
}
