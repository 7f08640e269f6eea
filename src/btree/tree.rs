//! B+tree core.
//!
//! One tree per table (and one for the catalog), rooted at a fixed page
//! number that never changes for the tree's lifetime. The tree is agnostic
//! to what its cells contain; it orders them by the fixed-width integer key
//! in the cell prefix and exposes `find`, `insert`, `delete` and `scan`.
//!
//! Mutations keep these facts true: keys within a leaf are strictly
//! increasing through the cell-pointer array, every inner key of an
//! internal node equals the max key of that child's subtree, the right
//! child's subtree max is strictly greater than the last inner key, and
//! every non-root node's parent pointer names the page that references it.
//!
//! Splits and compactions are out-of-place: cells or children are gathered
//! into local vectors, written onto freshly allocated pages, and only then
//! are parent references swung and the old pages returned to the pager.
//! Scalars are always copied out of a page before another page is fetched,
//! so a single mutable pager borrow is live at any time.

use crate::error::{Result, StorageError};
use crate::page::layout::{
    LEAF_NODE_CELL_POINTER_SIZE, LEAF_NODE_MAX_CELL_SIZE, LEAF_NODE_NON_HEADER_SPACE,
};
use crate::page::{cell, InternalNode, LeafNode, NodeType};
use crate::storage::Pager;
use crate::types::{PageId, INTERNAL_MAX_CELLS, INTERNAL_MAX_CHILDREN, LEAF_MAX_CELLS};
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

/// Position of a child within its parent internal node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildSlot {
    /// Inner cell index; may equal `num_keys` when a searched key falls
    /// between the last inner key and the right child's subtree
    Inner(usize),
    /// The distinguished right child
    Right,
}

/// A B+tree over pages owned by a shared pager
#[derive(Clone)]
pub struct Tree {
    pager: Arc<RwLock<Pager>>,
    root: PageId,
}

impl Tree {
    /// Attach to the tree rooted at `root`, initializing the root as an
    /// empty leaf if the page has never been materialized
    pub fn open(pager: Arc<RwLock<Pager>>, root: PageId) -> Result<Self> {
        let tree = Self { pager, root };
        {
            let pager = &mut *tree.pager.write();
            if !pager.page_exists(root) {
                LeafNode::init(pager.page(root)?, true, root);
            }
        }
        Ok(tree)
    }

    /// Create a fresh tree on `root`, unconditionally re-initializing the
    /// page. Required when the root page number came off the free list and
    /// still carries stale bytes.
    pub fn create(pager: Arc<RwLock<Pager>>, root: PageId) -> Result<Self> {
        let tree = Self { pager, root };
        {
            let pager = &mut *tree.pager.write();
            LeafNode::init(pager.page(root)?, true, root);
        }
        Ok(tree)
    }

    /// Root page number; stable for the tree's lifetime
    pub fn root_page_num(&self) -> PageId {
        self.root
    }

    pub(crate) fn pager(&self) -> &Arc<RwLock<Pager>> {
        &self.pager
    }

    // section: public interface

    /// Locate `key`: the leaf page that holds it (or would hold it) and the
    /// cell position within that leaf
    pub fn find(&self, key: u32) -> Result<(PageId, usize)> {
        let pager = &mut *self.pager.write();
        self.find_from(pager, key)
    }

    /// Insert a cell. Rejects keys already present and cells that cannot
    /// fit on a single leaf; either rejection leaves the tree untouched.
    pub fn insert(&self, cell_bytes: &[u8]) -> Result<()> {
        let (key, _) = cell::parse_cell(cell_bytes)?;
        if cell_bytes.len() > LEAF_NODE_MAX_CELL_SIZE {
            return Err(StorageError::CellTooLarge {
                size: cell_bytes.len(),
                max: LEAF_NODE_MAX_CELL_SIZE,
            });
        }

        let pager = &mut *self.pager.write();
        let (page_num, cell_num) = self.find_from(pager, key)?;
        let duplicate = {
            let leaf = LeafNode::new(pager.page(page_num)?);
            cell_num < leaf.num_cells() && leaf.key(cell_num) == key
        };
        if duplicate {
            return Err(StorageError::DuplicateKey);
        }
        self.leaf_node_insert(pager, page_num, cell_num, cell_bytes, key)
    }

    /// Delete `key`. Deleting an absent key succeeds with no effect.
    pub fn delete(&self, key: u32) -> Result<()> {
        let pager = &mut *self.pager.write();
        let (page_num, cell_num) = self.find_from(pager, key)?;
        let present = {
            let leaf = LeafNode::new(pager.page(page_num)?);
            cell_num < leaf.num_cells() && leaf.key(cell_num) == key
        };
        if !present {
            return Ok(());
        }
        self.leaf_node_delete(pager, page_num, cell_num)
    }

    /// All cells in key order as `(key, data)` pairs
    pub fn scan(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut cursor = crate::btree::Cursor::new(self)?;
        while !cursor.at_end() {
            let cell_bytes = cursor.cell()?;
            let (key, data) = cell::parse_cell(&cell_bytes)?;
            out.push((key, data.to_vec()));
            cursor.advance()?;
        }
        Ok(out)
    }

    /// Every page reachable from the root, the root included
    pub fn all_pages(&self) -> Result<Vec<PageId>> {
        let pager = &mut *self.pager.write();
        self.collect_pages(pager)
    }

    pub(crate) fn collect_pages(&self, pager: &mut Pager) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root];
        while let Some(page_num) = stack.pop() {
            pages.push(page_num);
            if pager.page(page_num)?.node_type()? == NodeType::Internal {
                let node = InternalNode::new(pager.page(page_num)?);
                let mut children: Vec<PageId> = (0..node.num_keys()).map(|i| node.child(i)).collect();
                if let Some(right) = node.right_child() {
                    children.push(right);
                }
                stack.extend(children);
            }
        }
        Ok(pages)
    }

    // section: find

    pub(crate) fn find_from(&self, pager: &mut Pager, key: u32) -> Result<(PageId, usize)> {
        let mut page_num = self.root;
        loop {
            match pager.page(page_num)?.node_type()? {
                NodeType::Internal => {
                    let slot = self.internal_node_find(pager, page_num, key)?;
                    let node = InternalNode::new(pager.page(page_num)?);
                    let num_keys = node.num_keys();
                    page_num = match slot {
                        ChildSlot::Inner(i) if i < num_keys => node.child(i),
                        _ => node.right_child().ok_or_else(|| {
                            StorageError::corruption(format!(
                                "internal node {page_num} routes right but has no right child"
                            ))
                        })?,
                    };
                }
                NodeType::Leaf => {
                    let cell_num = self.leaf_node_find(pager, page_num, key)?;
                    return Ok((page_num, cell_num));
                }
            }
        }
    }

    /// Binary-search the leaf's cell-pointer array for the insertion slot
    /// of `key`; the slot holds `key` itself when present
    fn leaf_node_find(&self, pager: &mut Pager, page_num: PageId, key: u32) -> Result<usize> {
        let leaf = LeafNode::new(pager.page(page_num)?);
        let mut lo = 0;
        let mut hi = leaf.num_cells();
        while lo != hi {
            let mid = lo + (hi - lo) / 2;
            let key_at_mid = leaf.key(mid);
            if key == key_at_mid {
                return Ok(mid);
            }
            if key < key_at_mid {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Locate the child slot `key` routes to within an internal node.
    ///
    /// A key equal to an inner key routes to that inner child, since inner
    /// keys mirror child subtree maxes. A key greater than every inner key
    /// but within the node's subtree max lands past the last inner cell;
    /// anything greater routes to the right child.
    pub(crate) fn internal_node_find(
        &self,
        pager: &mut Pager,
        page_num: PageId,
        key: u32,
    ) -> Result<ChildSlot> {
        let node_max = self.node_max_key(pager, page_num)?;
        let (num_keys, has_right) = {
            let node = InternalNode::new(pager.page(page_num)?);
            (node.num_keys(), node.has_right_child())
        };

        let node_max = match node_max {
            // no max: the node is empty, or its right child holds nothing
            None => {
                return Ok(if has_right {
                    ChildSlot::Right
                } else {
                    ChildSlot::Inner(0)
                })
            }
            Some(max) => max,
        };

        if node_max <= key {
            return Ok(ChildSlot::Right);
        }
        if num_keys == 0 {
            // unary node: its single child is the right child
            return Ok(ChildSlot::Inner(0));
        }

        let node = InternalNode::new(pager.page(page_num)?);
        let mut lo = 0;
        let mut hi = num_keys;
        while lo != hi {
            let mid = lo + (hi - lo) / 2;
            let key_at_mid = node.key(mid);
            if key == key_at_mid {
                return Ok(ChildSlot::Inner(mid));
            }
            if key < key_at_mid {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(ChildSlot::Inner(lo))
    }

    /// Max key in the subtree under `page_num`: the last key of the
    /// rightmost reachable leaf. `None` for an empty subtree.
    pub(crate) fn node_max_key(&self, pager: &mut Pager, page_num: PageId) -> Result<Option<u32>> {
        let mut page_num = page_num;
        loop {
            match pager.page(page_num)?.node_type()? {
                NodeType::Internal => {
                    let node = InternalNode::new(pager.page(page_num)?);
                    match node.right_child() {
                        Some(right) => page_num = right,
                        None => return Ok(None),
                    }
                }
                NodeType::Leaf => {
                    let leaf = LeafNode::new(pager.page(page_num)?);
                    let num_cells = leaf.num_cells();
                    return Ok(if num_cells == 0 {
                        None
                    } else {
                        Some(leaf.key(num_cells - 1))
                    });
                }
            }
        }
    }

    // section: insert

    /// Place a cell on the leaf, or split the leaf when neither the free
    /// list nor the allocation block (even after compaction) can take it.
    ///
    /// Allocation order: a free-list block large enough for the cell, then
    /// the allocation block, then compaction followed by the allocation
    /// block.
    fn leaf_node_insert(
        &self,
        pager: &mut Pager,
        page_num: PageId,
        cell_num: usize,
        cell_bytes: &[u8],
        key: u32,
    ) -> Result<()> {
        let needed = cell_bytes.len();
        let (num_cells, alloc_space, free_space) = {
            let leaf = LeafNode::new(pager.page(page_num)?);
            (
                leaf.num_cells(),
                leaf.alloc_block_space(),
                leaf.total_free_list_bytes(),
            )
        };

        // the cell pointer itself always comes out of the allocation block
        if alloc_space + free_space < needed + LEAF_NODE_CELL_POINTER_SIZE
            || num_cells >= LEAF_MAX_CELLS
        {
            return self.leaf_node_split_and_insert(pager, page_num, cell_num, cell_bytes);
        }

        // the rightmost key changes when the new cell lands past the tail
        let old_max = if cell_num == num_cells && cell_num != 0 {
            Some(LeafNode::new(pager.page(page_num)?).key(cell_num - 1))
        } else {
            None
        };

        {
            let mut leaf = LeafNode::new(pager.page(page_num)?);
            if leaf.alloc_block_space() < LEAF_NODE_CELL_POINTER_SIZE {
                leaf.compact();
            }
            let offset = match leaf.take_free_block(needed) {
                Some(offset) => offset,
                None => {
                    if leaf.alloc_block_space() < needed + LEAF_NODE_CELL_POINTER_SIZE {
                        debug!("compacting leaf {page_num} to fit {needed} bytes");
                        leaf.compact();
                    }
                    leaf.reserve_alloc_block(needed)?
                }
            };
            leaf.write_cell_at(offset, cell_bytes);
            leaf.insert_cellptr(cell_num, offset);
        }

        if let Some(old_max) = old_max {
            self.update_parent_on_new_right_child(pager, page_num, old_max, key)?;
        }
        Ok(())
    }

    /// Split the leaf out-of-place, merging the new cell in key order.
    ///
    /// Cells spill into fresh leaves left to right; a destination is closed
    /// once the next cell would exceed its byte budget or the per-leaf cell
    /// bound, so the source plus one cell produces two or three leaves.
    fn leaf_node_split_and_insert(
        &self,
        pager: &mut Pager,
        page_num: PageId,
        cell_num: usize,
        new_cell: &[u8],
    ) -> Result<()> {
        let (mut cells, parent, is_root) = {
            let node = pager.page(page_num)?;
            let is_root = node.is_root();
            let parent = node.parent();
            let leaf = LeafNode::new(node);
            let cells: Vec<Vec<u8>> = (0..leaf.num_cells()).map(|i| leaf.cell(i).to_vec()).collect();
            (cells, parent, is_root)
        };
        cells.insert(cell_num, new_cell.to_vec());

        let mut new_pages: Vec<PageId> = Vec::new();
        let mut dest = pager.allocate_page()?;
        LeafNode::init(pager.page(dest)?, false, parent);
        new_pages.push(dest);

        for cell_bytes in &cells {
            let (space, count) = {
                let leaf = LeafNode::new(pager.page(dest)?);
                (leaf.alloc_block_space(), leaf.num_cells())
            };
            if space < cell_bytes.len() + LEAF_NODE_CELL_POINTER_SIZE || count >= LEAF_MAX_CELLS {
                dest = pager.allocate_page()?;
                LeafNode::init(pager.page(dest)?, false, parent);
                new_pages.push(dest);
            }
            LeafNode::new(pager.page(dest)?).push_cell(cell_bytes)?;
        }

        if new_pages.len() < 2 || new_pages.len() > 3 {
            return Err(StorageError::corruption(format!(
                "leaf split produced {} pages",
                new_pages.len()
            )));
        }
        debug!("split leaf {page_num} into {} leaves", new_pages.len());

        let left = new_pages[0];
        let right = new_pages[new_pages.len() - 1];
        let middle = if new_pages.len() == 3 {
            Some(new_pages[1])
        } else {
            None
        };

        if is_root {
            self.create_new_root(pager, left, right, middle)
        } else {
            self.internal_node_insert(pager, page_num, left, right, middle)
        }
    }

    /// Swap a split child for its replacements inside the parent.
    ///
    /// `old_child` was split into `left`, `right` and possibly `middle`;
    /// they take its place in the parent, which itself splits when it lacks
    /// room for the one or two extra entries. The old page is returned to
    /// the pager here.
    fn internal_node_insert(
        &self,
        pager: &mut Pager,
        old_child: PageId,
        left: PageId,
        right: PageId,
        middle: Option<PageId>,
    ) -> Result<()> {
        let parent_page = pager.page(old_child)?.parent();
        let num_keys = { InternalNode::new(pager.page(parent_page)?).num_keys() };
        let num_new = 1 + middle.is_some() as usize;

        if num_keys + num_new > INTERNAL_MAX_CELLS {
            return self.internal_node_split_and_insert(pager, old_child, left, right, middle);
        }

        let old_max = self.require_max_key(pager, old_child)?;
        let left_max = self.require_max_key(pager, left)?;
        let right_max = self.require_max_key(pager, right)?;
        let middle = match middle {
            Some(m) => Some((m, self.require_max_key(pager, m)?)),
            None => None,
        };

        let slot = self.internal_node_find(pager, parent_page, old_max)?;
        let mut right_child_replaced = false;
        {
            let mut parent = InternalNode::new(pager.page(parent_page)?);
            let mut n = num_keys;
            match slot {
                ChildSlot::Right => {
                    // splits all sit right of the existing inner children:
                    // the rightmost split takes the right-child slot, the
                    // older siblings append as inner entries
                    parent.set_right_child(right);
                    parent.set_child(n, left);
                    parent.set_key(n, left_max);
                    n += 1;
                    if let Some((middle_page, middle_max)) = middle {
                        parent.set_child(n, middle_page);
                        parent.set_key(n, middle_max);
                        n += 1;
                    }
                    right_child_replaced = true;
                }
                ChildSlot::Inner(i) => {
                    if i >= num_keys {
                        return Err(StorageError::corruption(format!(
                            "split child {old_child} not found in parent {parent_page}"
                        )));
                    }
                    // left split takes the old slot; the tail shifts right
                    // to make room for the middle and right splits
                    parent.set_child(i, left);
                    parent.set_key(i, left_max);
                    let tail = parent.cells_from(i + 1);
                    parent.write_cells_at(i + 1 + num_new, &tail);
                    let mut next = i + 1;
                    if let Some((middle_page, middle_max)) = middle {
                        parent.set_child(next, middle_page);
                        parent.set_key(next, middle_max);
                        next += 1;
                        n += 1;
                    }
                    parent.set_child(next, right);
                    parent.set_key(next, right_max);
                    n += 1;
                }
            }
            parent.set_num_keys(n);
        }

        pager.return_page(old_child);

        if right_child_replaced && old_max < right_max {
            // subtree max grew; ancestors may reference the stale max
            self.update_parent_on_new_right_child(pager, parent_page, old_max, right_max)?;
        }
        Ok(())
    }

    /// Split a full parent while swapping in the replacement children.
    ///
    /// The parent's children (with the replacements substituted at the old
    /// child's slot) are redistributed onto two fresh internal nodes, the
    /// left one taking the extra child when the count is odd, and the pair
    /// is inserted into the grandparent recursively.
    fn internal_node_split_and_insert(
        &self,
        pager: &mut Pager,
        old_child: PageId,
        left: PageId,
        right: PageId,
        middle: Option<PageId>,
    ) -> Result<()> {
        let parent_page = pager.page(old_child)?.parent();
        let (grandparent, parent_is_root) = {
            let node = pager.page(parent_page)?;
            (node.parent(), node.is_root())
        };
        let old_max = self.require_max_key(pager, old_child)?;
        let slot = self.internal_node_find(pager, parent_page, old_max)?;
        let (num_keys, right_child) = {
            let node = InternalNode::new(pager.page(parent_page)?);
            (node.num_keys(), node.right_child())
        };

        let mut replacements = vec![left];
        if let Some(middle_page) = middle {
            replacements.push(middle_page);
        }
        replacements.push(right);

        // children of the parent in key order, with the old child replaced
        let mut ordered: Vec<PageId> = Vec::with_capacity(num_keys + 1 + replacements.len());
        for i in 0..num_keys {
            if slot == ChildSlot::Inner(i) {
                ordered.extend(&replacements);
            } else {
                ordered.push(InternalNode::new(pager.page(parent_page)?).child(i));
            }
        }
        match slot {
            ChildSlot::Right => ordered.extend(&replacements),
            ChildSlot::Inner(i) if i >= num_keys => {
                return Err(StorageError::corruption(format!(
                    "split child {old_child} not found in parent {parent_page}"
                )));
            }
            _ => ordered.push(right_child.ok_or_else(|| {
                StorageError::corruption(format!("internal node {parent_page} has no right child"))
            })?),
        }

        let total = ordered.len();
        let right_count = total / 2;
        let left_count = total - right_count;

        let left_parent = pager.allocate_page()?;
        InternalNode::init(pager.page(left_parent)?, false, grandparent);
        let right_parent = pager.allocate_page()?;
        InternalNode::init(pager.page(right_parent)?, false, grandparent);
        debug!("split internal {parent_page} into {left_parent} and {right_parent}");

        self.fill_internal(pager, left_parent, &ordered[..left_count])?;
        self.fill_internal(pager, right_parent, &ordered[left_count..])?;

        pager.return_page(old_child);

        if parent_is_root {
            self.create_new_root(pager, left_parent, right_parent, None)
        } else {
            self.internal_node_insert(pager, parent_page, left_parent, right_parent, None)
        }
    }

    /// Write `children` onto the internal node `dest`: all but the last
    /// become inner cells keyed by their subtree max, the last becomes the
    /// right child. Every child is re-parented to `dest`.
    fn fill_internal(&self, pager: &mut Pager, dest: PageId, children: &[PageId]) -> Result<()> {
        for (i, &child) in children.iter().enumerate() {
            if i == children.len() - 1 {
                InternalNode::new(pager.page(dest)?).set_right_child(child);
            } else {
                let child_max = self.require_max_key(pager, child)?;
                let mut node = InternalNode::new(pager.page(dest)?);
                node.set_child(i, child);
                node.set_key(i, child_max);
            }
            pager.page(child)?.set_parent(dest);
        }
        InternalNode::new(pager.page(dest)?).set_num_keys(children.len() - 1);
        Ok(())
    }

    /// Rebuild the root in place after its old content split into
    /// `left`/`middle`/`right`. The root's page number must not change, so
    /// a fresh internal node is written over the root page and the split
    /// pages become its children.
    fn create_new_root(
        &self,
        pager: &mut Pager,
        left: PageId,
        right: PageId,
        middle: Option<PageId>,
    ) -> Result<()> {
        let root = self.root;
        InternalNode::init(pager.page(root)?, true, root);
        debug!("root {root} grew into an internal node");

        let left_max = self.require_max_key(pager, left)?;
        {
            let node = pager.page(left)?;
            node.set_is_root(false);
            node.set_parent(root);
        }
        {
            let mut node = InternalNode::new(pager.page(root)?);
            node.set_child(0, left);
            node.set_key(0, left_max);
        }

        let mut num_keys = 1;
        if let Some(middle_page) = middle {
            let middle_max = self.require_max_key(pager, middle_page)?;
            {
                let node = pager.page(middle_page)?;
                node.set_is_root(false);
                node.set_parent(root);
            }
            {
                let mut node = InternalNode::new(pager.page(root)?);
                node.set_child(1, middle_page);
                node.set_key(1, middle_max);
            }
            num_keys = 2;
        }

        {
            let node = pager.page(right)?;
            node.set_is_root(false);
            node.set_parent(root);
        }
        {
            let mut node = InternalNode::new(pager.page(root)?);
            node.set_right_child(right);
            node.set_num_keys(num_keys);
        }
        Ok(())
    }

    // section: delete

    /// Remove the cell at `cell_num`, first checking whether the leaf plus
    /// its adjacent siblings would fit on strictly fewer pages afterwards;
    /// if so the whole sibling run is compacted instead of deleting in
    /// place.
    fn leaf_node_delete(&self, pager: &mut Pager, page_num: PageId, cell_num: usize) -> Result<()> {
        let (num_cells, is_root, del_key, del_cell_size) = {
            let node = pager.page(page_num)?;
            let is_root = node.is_root();
            let leaf = LeafNode::new(node);
            (
                leaf.num_cells(),
                is_root,
                leaf.key(cell_num),
                leaf.cell_size(cell_num),
            )
        };

        if !is_root {
            let left_sib = self.left_sibling(pager, page_num)?;
            let right_sib = self.right_sibling(pager, page_num)?;
            if left_sib.is_some() || right_sib.is_some() {
                let mut num_sibs = 1;
                let mut total_cells = num_cells - 1;
                let mut total_space = {
                    LeafNode::new(pager.page(page_num)?).used_cell_and_ptr_bytes()
                        - del_cell_size
                        - LEAF_NODE_CELL_POINTER_SIZE
                };
                for sib in [left_sib, right_sib].into_iter().flatten() {
                    let leaf = LeafNode::new(pager.page(sib)?);
                    num_sibs += 1;
                    total_cells += leaf.num_cells();
                    total_space += leaf.used_cell_and_ptr_bytes();
                }

                if total_cells <= (num_sibs - 1) * LEAF_MAX_CELLS
                    && total_space <= (num_sibs - 1) * LEAF_NODE_NON_HEADER_SPACE
                {
                    return self.leaf_node_compact_and_delete(pager, page_num, cell_num);
                }
            }
        }

        {
            let mut leaf = LeafNode::new(pager.page(page_num)?);
            leaf.deallocate_cell(cell_num);
            leaf.remove_cellptr(cell_num);
        }

        if cell_num == num_cells - 1 && cell_num != 0 {
            // the rightmost cell went away; ancestors may key on it
            let new_max = { LeafNode::new(pager.page(page_num)?).key(cell_num - 1) };
            self.update_parent_on_new_right_child(pager, page_num, del_key, new_max)?;
        }
        Ok(())
    }

    /// Redistribute the leaf and its siblings onto the minimum number of
    /// fresh leaves, dropping the deleted cell, then splice the new run
    /// into the parent.
    fn leaf_node_compact_and_delete(
        &self,
        pager: &mut Pager,
        page_num: PageId,
        cell_num: usize,
    ) -> Result<()> {
        let left_sib = self.left_sibling(pager, page_num)?;
        let right_sib = self.right_sibling(pager, page_num)?;
        let parent = pager.page(page_num)?.parent();

        // gather surviving cells in key order
        let mut cells: Vec<Vec<u8>> = Vec::new();
        for (src, skip) in [
            (left_sib, None),
            (Some(page_num), Some(cell_num)),
            (right_sib, None),
        ] {
            let Some(src) = src else { continue };
            let leaf = LeafNode::new(pager.page(src)?);
            for i in 0..leaf.num_cells() {
                if skip == Some(i) {
                    continue;
                }
                cells.push(leaf.cell(i).to_vec());
            }
        }

        let total_cells = cells.len();
        let total_space: usize = cells
            .iter()
            .map(|c| c.len() + LEAF_NODE_CELL_POINTER_SIZE)
            .sum();
        let by_space = total_space.div_euclid(LEAF_NODE_NON_HEADER_SPACE)
            + usize::from(total_space % LEAF_NODE_NON_HEADER_SPACE != 0);
        let by_count = total_cells.div_euclid(LEAF_MAX_CELLS)
            + usize::from(total_cells % LEAF_MAX_CELLS != 0);
        let num_dest = by_space.max(by_count).max(1);

        // spread cells as evenly as possible, the earlier leaves taking the
        // extra when the division is uneven
        let min_cells = total_cells / num_dest;
        let extra = total_cells % num_dest;

        let mut new_pages: Vec<PageId> = Vec::new();
        let mut dest = pager.allocate_page()?;
        LeafNode::init(pager.page(dest)?, false, parent);
        new_pages.push(dest);

        for cell_bytes in &cells {
            let capacity = min_cells + usize::from(new_pages.len() <= extra);
            let (space, count) = {
                let leaf = LeafNode::new(pager.page(dest)?);
                (leaf.alloc_block_space(), leaf.num_cells())
            };
            if space < cell_bytes.len() + LEAF_NODE_CELL_POINTER_SIZE || count >= capacity {
                dest = pager.allocate_page()?;
                LeafNode::init(pager.page(dest)?, false, parent);
                new_pages.push(dest);
            }
            LeafNode::new(pager.page(dest)?).push_cell(cell_bytes)?;
        }
        debug!(
            "compacted leaf {page_num} and siblings into {} leaves",
            new_pages.len()
        );

        let new_left = new_pages[0];
        let new_right = new_pages.get(1).copied();
        if new_pages.len() > 2 {
            return Err(StorageError::corruption(format!(
                "leaf compaction produced {} pages",
                new_pages.len()
            )));
        }

        self.internal_node_delete(pager, left_sib, page_num, right_sib, new_left, new_right)
    }

    /// Replace a compacted run of children inside the parent.
    ///
    /// `old_middle` and its present neighbours were rewritten as `new_left`
    /// (and possibly `new_right`); the parent's child array is rebuilt with
    /// the new run spliced in, the old pages are returned, and the parent
    /// itself is compacted or collapsed if it fell below occupancy.
    fn internal_node_delete(
        &self,
        pager: &mut Pager,
        old_left: Option<PageId>,
        old_middle: PageId,
        old_right: Option<PageId>,
        new_left: PageId,
        new_right: Option<PageId>,
    ) -> Result<()> {
        let num_old = 1 + old_left.is_some() as usize + old_right.is_some() as usize;
        let num_new = 1 + new_right.is_some() as usize;
        if num_old <= num_new {
            return Err(StorageError::corruption(format!(
                "child replacement does not shrink: {num_old} -> {num_new}"
            )));
        }

        let old_middle_max = self.require_max_key(pager, old_middle)?;
        let parent_page = pager.page(old_middle)?.parent();
        let parent_is_root = pager.page(parent_page)?.is_root();
        let (num_keys, right_child) = {
            let node = InternalNode::new(pager.page(parent_page)?);
            (node.num_keys(), node.right_child())
        };

        let slot = self.internal_node_find(pager, parent_page, old_middle_max)?;
        let old_pos = match slot {
            ChildSlot::Inner(i) if i < num_keys => i,
            ChildSlot::Inner(_) => {
                return Err(StorageError::corruption(format!(
                    "compacted child {old_middle} not found in parent {parent_page}"
                )))
            }
            ChildSlot::Right => num_keys,
        };
        let first = if old_left.is_some() { old_pos - 1 } else { old_pos };
        let last = if old_right.is_some() { old_pos + 1 } else { old_pos };

        // children in key order, positions 0..=num_keys with the right
        // child last
        let mut children: Vec<PageId> = {
            let node = InternalNode::new(pager.page(parent_page)?);
            (0..num_keys).map(|i| node.child(i)).collect()
        };
        children.push(right_child.ok_or_else(|| {
            StorageError::corruption(format!("internal node {parent_page} has no right child"))
        })?);

        let span_covers_right = last == num_keys;
        let old_rightmost_max = if span_covers_right {
            Some(self.require_max_key(pager, children[last])?)
        } else {
            None
        };

        let mut replacements = vec![new_left];
        if let Some(right) = new_right {
            replacements.push(right);
        }
        for &child in &replacements {
            pager.page(child)?.set_parent(parent_page);
        }
        children.splice(first..=last, replacements);

        // rewrite the parent's cells; untouched entries keep their values
        let child_count = children.len();
        for (i, &child) in children[..child_count - 1].iter().enumerate() {
            let child_max = self.require_max_key(pager, child)?;
            let mut node = InternalNode::new(pager.page(parent_page)?);
            node.set_child(i, child);
            node.set_key(i, child_max);
        }
        {
            let mut node = InternalNode::new(pager.page(parent_page)?);
            node.set_right_child(children[child_count - 1]);
            node.set_num_keys(child_count - 1);
        }

        if let Some(old_max) = old_rightmost_max {
            let new_max = self.require_max_key(pager, children[child_count - 1])?;
            if old_max != new_max {
                self.update_parent_on_new_right_child(pager, parent_page, old_max, new_max)?;
            }
        }

        pager.return_page(old_middle);
        if let Some(page) = old_left {
            pager.return_page(page);
        }
        if let Some(page) = old_right {
            pager.return_page(page);
        }

        if !parent_is_root {
            // collective underflow test across the parent and its siblings
            let parent_left = self.left_sibling(pager, parent_page)?;
            let parent_right = self.right_sibling(pager, parent_page)?;
            let mut num_sibs = 1;
            let mut total_children =
                { InternalNode::new(pager.page(parent_page)?).num_children() };
            for sib in [parent_left, parent_right].into_iter().flatten() {
                num_sibs += 1;
                total_children += InternalNode::new(pager.page(sib)?).num_children();
            }
            if total_children <= (num_sibs - 1) * INTERNAL_MAX_CHILDREN {
                return self.internal_node_compact(pager, parent_page);
            }
        } else if child_count - 1 == 0 {
            self.collapse_root(pager)?;
        }
        Ok(())
    }

    /// Redistribute an under-occupied internal node and its siblings onto
    /// the minimum number of fresh internal nodes, then recurse into the
    /// parent through the same replacement path the leaves use.
    fn internal_node_compact(&self, pager: &mut Pager, page_num: PageId) -> Result<()> {
        let parent_page = pager.page(page_num)?.parent();
        let left_sib = self.left_sibling(pager, page_num)?;
        let right_sib = self.right_sibling(pager, page_num)?;

        let mut children: Vec<PageId> = Vec::new();
        for src in [left_sib, Some(page_num), right_sib].into_iter().flatten() {
            let node = InternalNode::new(pager.page(src)?);
            let num_keys = node.num_keys();
            let right_child = node.right_child();
            for i in 0..num_keys {
                children.push(node.child(i));
            }
            children.push(right_child.ok_or_else(|| {
                StorageError::corruption(format!("internal node {src} has no right child"))
            })?);
        }

        let total = children.len();
        let num_dest = total.div_euclid(INTERNAL_MAX_CHILDREN)
            + usize::from(total % INTERNAL_MAX_CHILDREN != 0);
        let min_children = total / num_dest;
        let extra = total % num_dest;

        let mut new_pages: Vec<PageId> = Vec::new();
        let mut taken = 0;
        for dest_index in 0..num_dest {
            let count = min_children + usize::from(dest_index < extra);
            let dest = pager.allocate_page()?;
            InternalNode::init(pager.page(dest)?, false, parent_page);
            self.fill_internal(pager, dest, &children[taken..taken + count])?;
            taken += count;
            new_pages.push(dest);
        }
        debug!(
            "compacted internal {page_num} and siblings into {} nodes",
            new_pages.len()
        );

        let new_left = new_pages[0];
        let new_right = new_pages.get(1).copied();
        self.internal_node_delete(pager, left_sib, page_num, right_sib, new_left, new_right)
    }

    /// Shrink the tree when the root is an internal node with no inner
    /// keys: its sole right child's content moves onto the root page (the
    /// root page number is fixed), or the root resets to an empty leaf when
    /// nothing is left.
    fn collapse_root(&self, pager: &mut Pager) -> Result<()> {
        let root = self.root;
        let (num_keys, right_child) = {
            let node = InternalNode::new(pager.page(root)?);
            (node.num_keys(), node.right_child())
        };
        if num_keys > 0 {
            return Ok(());
        }

        match right_child {
            None => {
                LeafNode::init(pager.page(root)?, true, root);
                debug!("root {root} reset to an empty leaf");
            }
            Some(child) => {
                let child_bytes = pager.page(child)?.as_bytes().to_vec();
                {
                    let node = pager.page(root)?;
                    node.as_bytes_mut().copy_from_slice(&child_bytes);
                    node.set_is_root(true);
                    node.set_parent(root);
                }
                self.reparent_children(pager, root)?;
                pager.return_page(child);
                debug!("root {root} collapsed over child {child}");
            }
        }
        Ok(())
    }

    // section: shared helpers

    /// Rewrite the parent pointer of every direct child after a node's
    /// content moved to `page_num`
    fn reparent_children(&self, pager: &mut Pager, page_num: PageId) -> Result<()> {
        if pager.page(page_num)?.node_type()? != NodeType::Internal {
            return Ok(());
        }
        let children: Vec<PageId> = {
            let node = InternalNode::new(pager.page(page_num)?);
            let mut children: Vec<PageId> = (0..node.num_keys()).map(|i| node.child(i)).collect();
            if let Some(right) = node.right_child() {
                children.push(right);
            }
            children
        };
        for child in children {
            pager.page(child)?.set_parent(page_num);
        }
        Ok(())
    }

    /// Walk the ancestor chain after the subtree max under `page_num`
    /// changed from `old_key` to `new_key`: climb while the node is its
    /// parent's right child, then rewrite the one inner key that referenced
    /// the stale max.
    fn update_parent_on_new_right_child(
        &self,
        pager: &mut Pager,
        page_num: PageId,
        old_key: u32,
        new_key: u32,
    ) -> Result<()> {
        let mut page_num = page_num;
        loop {
            if pager.page(page_num)?.is_root() {
                return Ok(());
            }
            let parent_page = pager.page(page_num)?.parent();
            let slot = self.internal_node_find(pager, parent_page, old_key)?;
            let num_keys = { InternalNode::new(pager.page(parent_page)?).num_keys() };
            match slot {
                ChildSlot::Inner(i) if i < num_keys => {
                    InternalNode::new(pager.page(parent_page)?).set_key(i, new_key);
                    return Ok(());
                }
                _ => page_num = parent_page,
            }
        }
    }

    /// Left adjacent sibling under the same parent, if any
    fn left_sibling(&self, pager: &mut Pager, page_num: PageId) -> Result<Option<PageId>> {
        if pager.page(page_num)?.is_root() {
            return Ok(None);
        }
        let Some(node_max) = self.node_max_key(pager, page_num)? else {
            return Ok(None);
        };
        let parent_page = pager.page(page_num)?.parent();
        let slot = self.internal_node_find(pager, parent_page, node_max)?;
        let num_keys = { InternalNode::new(pager.page(parent_page)?).num_keys() };

        let sibling = match slot {
            ChildSlot::Right => {
                if num_keys == 0 {
                    None
                } else {
                    Some(InternalNode::new(pager.page(parent_page)?).child(num_keys - 1))
                }
            }
            ChildSlot::Inner(0) => None,
            ChildSlot::Inner(i) => Some(InternalNode::new(pager.page(parent_page)?).child(i - 1)),
        };
        Ok(sibling.filter(|&s| s != page_num))
    }

    /// Right adjacent sibling under the same parent, if any
    fn right_sibling(&self, pager: &mut Pager, page_num: PageId) -> Result<Option<PageId>> {
        if pager.page(page_num)?.is_root() {
            return Ok(None);
        }
        let Some(node_max) = self.node_max_key(pager, page_num)? else {
            return Ok(None);
        };
        let parent_page = pager.page(page_num)?.parent();
        let slot = self.internal_node_find(pager, parent_page, node_max)?;
        let num_keys = { InternalNode::new(pager.page(parent_page)?).num_keys() };

        let sibling = match slot {
            ChildSlot::Right => None,
            ChildSlot::Inner(i) if i + 1 == num_keys => {
                InternalNode::new(pager.page(parent_page)?).right_child()
            }
            ChildSlot::Inner(i) => Some(InternalNode::new(pager.page(parent_page)?).child(i + 1)),
        };
        Ok(sibling.filter(|&s| s != page_num))
    }

    fn require_max_key(&self, pager: &mut Pager, page_num: PageId) -> Result<u32> {
        self.node_max_key(pager, page_num)?.ok_or_else(|| {
            StorageError::corruption(format!("node {page_num} has no max key"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::cell::build_cell;
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::{tempdir, TempDir};

    fn test_tree() -> (Tree, Arc<RwLock<Pager>>, TempDir) {
        let dir = tempdir().unwrap();
        let pager = Arc::new(RwLock::new(Pager::open(&dir.path().join("test.db")).unwrap()));
        let tree = Tree::open(Arc::clone(&pager), PageId::new(0)).unwrap();
        (tree, pager, dir)
    }

    fn insert_key(tree: &Tree, key: u32) -> Result<()> {
        tree.insert(&build_cell(key, format!("row-{key}").as_bytes()))
    }

    fn scan_keys(tree: &Tree) -> Vec<u32> {
        tree.scan().unwrap().into_iter().map(|(k, _)| k).collect()
    }

    fn sorted(mut keys: Vec<u32>) -> Vec<u32> {
        keys.sort_unstable();
        keys
    }

    #[test]
    fn test_insert_and_scan_in_order() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        for key in [1, 2, 3, 4] {
            insert_key(&tree, key)?;
        }
        assert_eq!(scan_keys(&tree), vec![1, 2, 3, 4]);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        insert_key(&tree, 42)?;
        assert!(matches!(
            insert_key(&tree, 42),
            Err(StorageError::DuplicateKey)
        ));
        assert_eq!(scan_keys(&tree), vec![42]);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_delete_missing_key_is_noop() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        tree.delete(7)?;
        insert_key(&tree, 1)?;
        tree.delete(7)?;
        assert_eq!(scan_keys(&tree), vec![1]);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_split_grows_internal_root() -> Result<()> {
        let (tree, pager, _dir) = test_tree();
        for key in [10, 20, 30, 5] {
            insert_key(&tree, key)?;
        }

        {
            let pager = &mut *pager.write();
            assert_eq!(pager.page(tree.root_page_num())?.node_type()?, NodeType::Internal);
        }
        assert_eq!(scan_keys(&tree), vec![5, 10, 20, 30]);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_rightmost_insert_updates_ancestor_keys() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        for key in 1..=20 {
            insert_key(&tree, key)?;
            tree.validate()?;
        }
        assert_eq!(scan_keys(&tree), (1..=20).collect::<Vec<u32>>());
        Ok(())
    }

    #[test]
    fn test_internal_split_deepens_tree() -> Result<()> {
        let keys = [159, 597, 520, 189, 822, 725, 504, 397, 218, 134, 516];
        let (tree, pager, _dir) = test_tree();
        for key in keys {
            insert_key(&tree, key)?;
            tree.validate()?;
        }

        {
            let pager = &mut *pager.write();
            let root = tree.root_page_num();
            assert_eq!(pager.page(root)?.node_type()?, NodeType::Internal);
            let first_child = { InternalNode::new(pager.page(root)?).child(0) };
            assert_eq!(pager.page(first_child)?.node_type()?, NodeType::Internal);
        }
        assert_eq!(scan_keys(&tree), sorted(keys.to_vec()));
        Ok(())
    }

    #[test]
    fn test_delete_triggers_leaf_compaction() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        for key in [10, 20, 30, 5] {
            insert_key(&tree, key)?;
        }

        let pages_before = tree.all_pages()?.len();
        tree.delete(20)?;
        tree.validate()?;
        assert_eq!(scan_keys(&tree), vec![5, 10, 30]);

        // the sibling leaves merged; the tree now occupies fewer pages
        assert!(tree.all_pages()?.len() < pages_before);
        Ok(())
    }

    #[test]
    fn test_delete_all_resets_root_to_empty_leaf() -> Result<()> {
        let keys = [72, 79, 96, 38, 47];
        let (tree, pager, _dir) = test_tree();
        let root = tree.root_page_num();

        for key in keys {
            insert_key(&tree, key)?;
        }
        for key in [96, 38, 72, 47, 79] {
            tree.delete(key)?;
            tree.validate()?;
        }

        assert_eq!(scan_keys(&tree), Vec::<u32>::new());
        assert_eq!(tree.root_page_num(), root);
        {
            let pager = &mut *pager.write();
            let node = pager.page(root)?;
            assert_eq!(node.node_type()?, NodeType::Leaf);
            assert!(node.is_root());
            assert_eq!(LeafNode::new(node).num_cells(), 0);
        }
        Ok(())
    }

    #[test]
    fn test_leaf_free_list_reuse_on_root() -> Result<()> {
        let (tree, pager, _dir) = test_tree();
        for key in [1, 2, 3] {
            insert_key(&tree, key)?;
        }
        // root deletes never compact, so the middle cell lands on the
        // intra-leaf free list
        tree.delete(2)?;
        {
            let pager = &mut *pager.write();
            let leaf = LeafNode::new(pager.page(tree.root_page_num())?);
            assert!(leaf.total_free_list_bytes() > 0);
        }

        insert_key(&tree, 2)?;
        {
            let pager = &mut *pager.write();
            let leaf = LeafNode::new(pager.page(tree.root_page_num())?);
            assert_eq!(leaf.total_free_list_bytes(), 0);
        }
        assert_eq!(scan_keys(&tree), vec![1, 2, 3]);
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_variable_size_cells_split_on_bytes() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        // large enough that two cells exhaust a leaf's byte budget before
        // the cell-count bound is reached
        let payload = vec![0xABu8; 1500];
        for key in [4, 1, 3, 2, 6, 5] {
            tree.insert(&build_cell(key, &payload))?;
            tree.validate()?;
        }
        assert_eq!(scan_keys(&tree), vec![1, 2, 3, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn test_oversized_cell_rejected() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        let oversized = vec![0u8; LEAF_NODE_MAX_CELL_SIZE + 1];
        assert!(matches!(
            tree.insert(&build_cell(1, &oversized)),
            Err(StorageError::CellTooLarge { .. })
        ));
        assert_eq!(scan_keys(&tree), Vec::<u32>::new());
        Ok(())
    }

    #[test]
    fn test_root_page_is_stable() -> Result<()> {
        let (tree, _pager, _dir) = test_tree();
        let root = tree.root_page_num();
        for key in [159, 597, 520, 189, 822, 725, 504, 397, 218, 134, 516] {
            insert_key(&tree, key)?;
            assert_eq!(tree.root_page_num(), root);
        }
        for key in [520, 134, 822, 159, 597] {
            tree.delete(key)?;
            assert_eq!(tree.root_page_num(), root);
        }
        tree.validate()?;
        Ok(())
    }

    #[test]
    fn test_reopen_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let keys = [432, 507, 311, 35, 246, 950, 956, 929, 769, 744, 994, 438];

        {
            let pager = Arc::new(RwLock::new(Pager::open(&path)?));
            let tree = Tree::open(Arc::clone(&pager), PageId::new(0))?;
            for key in keys {
                insert_key(&tree, key)?;
            }
            tree.delete(950)?;
            tree.validate()?;
            pager.write().close()?;
        }

        {
            let pager = Arc::new(RwLock::new(Pager::open(&path)?));
            let tree = Tree::open(Arc::clone(&pager), PageId::new(0))?;
            tree.validate()?;
            let mut expected: Vec<u32> = keys.iter().copied().filter(|&k| k != 950).collect();
            expected.sort_unstable();
            assert_eq!(scan_keys(&tree), expected);

            for key in expected {
                let (page_num, cell_num) = tree.find(key)?;
                let found = {
                    let pager = &mut *pager.write();
                    LeafNode::new(pager.page(page_num)?).key(cell_num)
                };
                assert_eq!(found, key);
            }
            pager.write().close()?;
        }

        // closing without mutations is idempotent on queries
        {
            let pager = Arc::new(RwLock::new(Pager::open(&path)?));
            let tree = Tree::open(Arc::clone(&pager), PageId::new(0))?;
            tree.validate()?;
        }
        Ok(())
    }

    #[test]
    fn test_free_page_conservation_after_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let keys = [229, 653, 248, 298, 801, 947, 63, 619, 475, 422, 856, 57, 38];

        {
            let pager = Arc::new(RwLock::new(Pager::open(&path)?));
            let tree = Tree::open(Arc::clone(&pager), PageId::new(0))?;
            for key in keys {
                insert_key(&tree, key)?;
            }
            for key in [947, 63, 229, 856, 298, 801] {
                tree.delete(key)?;
            }
            tree.validate()?;
            pager.write().close()?;
        }

        {
            let pager = Arc::new(RwLock::new(Pager::open(&path)?));
            let tree = Tree::open(Arc::clone(&pager), PageId::new(0))?;

            let live = tree.all_pages()?;
            let (free, num_pages) = {
                let pager = &mut *pager.write();
                (pager.free_page_list()?, pager.num_pages())
            };

            let mut seen: Vec<PageId> = live.iter().chain(free.iter()).copied().collect();
            seen.sort_unstable();
            let expected: Vec<PageId> = (0..num_pages).map(|n| PageId::new(n as u32)).collect();
            assert_eq!(seen, expected, "live and free pages must partition the file");
        }
        Ok(())
    }

    #[test]
    fn test_insert_delete_permutation_stress() -> Result<()> {
        let test_cases: Vec<Vec<u32>> = vec![
            vec![1, 2, 3, 4],
            vec![64, 5, 13, 82],
            vec![82, 13, 5, 2, 1],
            vec![10, 20, 30, 40, 50, 60, 70],
            vec![72, 79, 96, 38, 47],
            vec![432, 507, 311, 35, 246, 950, 956, 929, 769, 744, 994, 438],
            vec![159, 597, 520, 189, 822, 725, 504, 397, 218, 134, 516],
            vec![960, 267, 947, 400, 795, 327, 464, 884, 667, 870, 92],
        ];
        let mut rng = StdRng::seed_from_u64(0x5107);

        for keys in &test_cases {
            for _ in 0..3 {
                let mut insert_order = keys.clone();
                let mut delete_order = keys.clone();
                insert_order.shuffle(&mut rng);
                delete_order.shuffle(&mut rng);

                let (tree, _pager, _dir) = test_tree();
                for &key in &insert_order {
                    insert_key(&tree, key)?;
                    tree.validate()?;
                }
                assert_eq!(scan_keys(&tree), sorted(keys.clone()));

                for (i, &key) in delete_order.iter().enumerate() {
                    tree.delete(key)?;
                    tree.validate()?;
                    let expected = sorted(delete_order[i + 1..].to_vec());
                    assert_eq!(
                        scan_keys(&tree),
                        expected,
                        "after deleting {key} (insert order {insert_order:?}, delete order {delete_order:?})"
                    );
                }
            }
        }
        Ok(())
    }
}
