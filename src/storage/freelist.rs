//! Returned-page tracking.
//!
//! Pages handed back by the tree are kept in memory for the rest of the
//! session and reused LIFO before any other allocation source. Only at
//! close are the survivors either truncated off the end of the file or
//! linked into the on-disk free-page list.

use crate::types::PageId;

/// Pages returned during this session, available for immediate reuse
#[derive(Debug, Default)]
pub struct ReturnedPages {
    pages: Vec<PageId>,
}

impl ReturnedPages {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Record a returned page
    pub fn push(&mut self, page_num: PageId) {
        self.pages.push(page_num);
    }

    /// Take the most recently returned page
    pub fn pop(&mut self) -> Option<PageId> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Sort ascending so the largest page number sits at the tail. Used by
    /// the close path to peel truncatable pages off the end of the file.
    pub fn sort(&mut self) {
        self.pages.sort_unstable();
    }

    /// Largest page number after a `sort`
    pub fn last(&self) -> Option<PageId> {
        self.pages.last().copied()
    }

    pub fn as_slice(&self) -> &[PageId] {
        &self.pages
    }
}
