//! B+tree layer.
//!
//! Key-ordered insert/find/delete over opaque cells, with out-of-place
//! splits, compaction on underflow, and ordered traversal via [`Cursor`].

mod cursor;
mod tree;
mod validate;

pub use cursor::Cursor;
pub use tree::Tree;
