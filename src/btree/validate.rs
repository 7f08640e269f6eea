//! Tree validators.
//!
//! Every check walks the whole tree and reports the first violation as a
//! corruption error: key ordering with subtree bounds, parent keys
//! mirroring child subtree maxes, parent back-references, and intra-leaf
//! space accounting.

use crate::btree::Tree;
use crate::error::{Result, StorageError};
use crate::page::layout::{LEAF_NODE_NON_HEADER_SPACE, PAGE_SIZE};
use crate::page::{InternalNode, LeafNode, NodeType};
use crate::storage::Pager;
use crate::types::PageId;

impl Tree {
    /// Run every structural validator, erroring on the first violation
    pub fn validate(&self) -> Result<()> {
        let pager = &mut *self.pager().write();
        self.validate_ordering(pager)?;
        self.validate_parent_refs(pager)?;
        self.validate_leaf_space(pager)
    }

    /// Keys are strictly ordered within every node and every key respects
    /// the bounds inherited from its ancestors; each internal node's right
    /// subtree max strictly exceeds its last inner key.
    fn validate_ordering(&self, pager: &mut Pager) -> Result<()> {
        let mut stack: Vec<(PageId, i64, i64)> =
            vec![(self.root_page_num(), i64::MIN, i64::MAX)];

        while let Some((page_num, lower, upper)) = stack.pop() {
            match pager.page(page_num)?.node_type()? {
                NodeType::Internal => {
                    let (keys, children, right_child) = {
                        let node = InternalNode::new(pager.page(page_num)?);
                        let keys: Vec<u32> = (0..node.num_keys()).map(|i| node.key(i)).collect();
                        let children: Vec<PageId> =
                            (0..node.num_keys()).map(|i| node.child(i)).collect();
                        (keys, children, node.right_child())
                    };

                    for (i, &key) in keys.iter().enumerate() {
                        let key_wide = key as i64;
                        if key_wide <= lower || key_wide > upper {
                            return Err(StorageError::corruption(format!(
                                "key {key} on node {page_num} violates bounds ({lower}, {upper}]"
                            )));
                        }
                        if i > 0 && key <= keys[i - 1] {
                            return Err(StorageError::corruption(format!(
                                "inner keys out of order on node {page_num}: {} then {key}",
                                keys[i - 1]
                            )));
                        }
                        let child_lower = if i > 0 { keys[i - 1] as i64 } else { lower };
                        stack.push((children[i], child_lower, key_wide));
                    }

                    if !keys.is_empty() {
                        let right = right_child.ok_or_else(|| {
                            StorageError::corruption(format!(
                                "node {page_num} has inner keys but no right child"
                            ))
                        })?;
                        let right_max =
                            self.node_max_key(pager, right)?.ok_or_else(|| {
                                StorageError::corruption(format!(
                                    "right child {right} of node {page_num} is empty"
                                ))
                            })?;
                        let last_key = keys[keys.len() - 1];
                        if right_max <= last_key {
                            return Err(StorageError::corruption(format!(
                                "right subtree max {right_max} not greater than last inner key {last_key} on node {page_num}"
                            )));
                        }
                    }

                    if let Some(right) = right_child {
                        let right_lower = keys.last().map(|&k| k as i64).unwrap_or(lower);
                        stack.push((right, right_lower, upper));
                    }
                }
                NodeType::Leaf => {
                    let leaf = LeafNode::new(pager.page(page_num)?);
                    for i in 1..leaf.num_cells() {
                        if leaf.key(i) <= leaf.key(i - 1) {
                            return Err(StorageError::corruption(format!(
                                "leaf keys out of order on node {page_num}: {} then {}",
                                leaf.key(i - 1),
                                leaf.key(i)
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Each inner key equals the max key of its child's subtree and every
    /// referenced child points back at its parent.
    fn validate_parent_refs(&self, pager: &mut Pager) -> Result<()> {
        let mut stack = vec![self.root_page_num()];
        while let Some(page_num) = stack.pop() {
            if pager.page(page_num)?.node_type()? != NodeType::Internal {
                continue;
            }
            let (keys, mut children) = {
                let node = InternalNode::new(pager.page(page_num)?);
                let keys: Vec<u32> = (0..node.num_keys()).map(|i| node.key(i)).collect();
                let mut children: Vec<PageId> =
                    (0..node.num_keys()).map(|i| node.child(i)).collect();
                if let Some(right) = node.right_child() {
                    children.push(right);
                }
                (keys, children)
            };

            for (i, &child) in children.iter().enumerate() {
                let child_parent = pager.page(child)?.parent();
                if child_parent != page_num {
                    return Err(StorageError::corruption(format!(
                        "child {child} points at parent {child_parent}, expected {page_num}"
                    )));
                }
                if i < keys.len() {
                    let child_max = self.node_max_key(pager, child)?;
                    if child_max != Some(keys[i]) {
                        return Err(StorageError::corruption(format!(
                            "inner key {} on node {page_num} does not match child {child} max {child_max:?}",
                            keys[i]
                        )));
                    }
                }
            }
            stack.append(&mut children);
        }
        Ok(())
    }

    /// Intra-leaf accounting: the free-list byte total matches the sum of
    /// its blocks, cells sit between `alloc_ptr` and the end of the page,
    /// and live bytes never exceed the non-header space.
    fn validate_leaf_space(&self, pager: &mut Pager) -> Result<()> {
        let mut stack = vec![self.root_page_num()];
        while let Some(page_num) = stack.pop() {
            match pager.page(page_num)?.node_type()? {
                NodeType::Internal => {
                    let node = InternalNode::new(pager.page(page_num)?);
                    let mut children: Vec<PageId> =
                        (0..node.num_keys()).map(|i| node.child(i)).collect();
                    if let Some(right) = node.right_child() {
                        children.push(right);
                    }
                    stack.append(&mut children);
                }
                NodeType::Leaf => {
                    let leaf = LeafNode::new(pager.page(page_num)?);

                    let block_total: usize =
                        leaf.free_blocks()?.iter().map(|&(_, size)| size).sum();
                    if block_total != leaf.total_free_list_bytes() {
                        return Err(StorageError::corruption(format!(
                            "leaf {page_num} free list sums to {block_total}, header says {}",
                            leaf.total_free_list_bytes()
                        )));
                    }

                    if leaf.alloc_ptr() < leaf.unallocated_start() {
                        return Err(StorageError::corruption(format!(
                            "leaf {page_num} alloc_ptr {} overlaps the cell-pointer array",
                            leaf.alloc_ptr()
                        )));
                    }

                    for i in 0..leaf.num_cells() {
                        let offset = leaf.cellptr(i);
                        if offset < leaf.alloc_ptr() || offset + leaf.cell_size(i) > PAGE_SIZE {
                            return Err(StorageError::corruption(format!(
                                "cell {i} on leaf {page_num} lies outside the allocated area"
                            )));
                        }
                    }

                    // whole-block reuse can strand a few bytes between a
                    // reused block and the cell written into it, so the
                    // three regions bound the space rather than tile it
                    let used = leaf.used_cell_and_ptr_bytes();
                    if leaf.alloc_block_space() + leaf.total_free_list_bytes() + used
                        > LEAF_NODE_NON_HEADER_SPACE
                    {
                        return Err(StorageError::corruption(format!(
                            "leaf {page_num} accounts for more than its non-header space"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
