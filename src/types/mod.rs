//! Common types and tuning constants.
//!
//! The constants here are tuning knobs: they bound node fan-out and cache
//! size but never change the on-disk format. Everything that does affect the
//! format lives in `page::layout`.

mod page_id;

pub use page_id::PageId;

/// Hard upper bound on the number of pages one engine instance manages.
/// Doubles as the page-cache size, so every live page fits in memory.
pub const MAX_PAGES: usize = 100;

/// Maximum number of cells on a leaf node.
///
/// Kept low so ordinary test workloads exercise splits and compactions; a
/// production build would raise this toward the page-space-derived bound.
pub const LEAF_MAX_CELLS: usize = 3;

/// Maximum number of inner cells on an internal node.
///
/// Must stay at least 3, otherwise delete rebalancing can produce unary
/// chains it cannot compact away.
pub const INTERNAL_MAX_CELLS: usize = 3;

/// Maximum children per internal node (inner cells plus the right child)
pub const INTERNAL_MAX_CHILDREN: usize = INTERNAL_MAX_CELLS + 1;
