//! The pager: file-backed page store.
//!
//! Translates page numbers into byte ranges of a single file laid out as
//! `[file header][page 0][page 1]...`, caches every materialized page in
//! memory, and owns page allocation. A new page number is sourced, in
//! order, from:
//!
//! 1. the in-memory list of pages returned during this session (LIFO),
//! 2. the on-disk free-page list persisted by a previous session,
//! 3. the end of the file.
//!
//! Nothing is written back until [`Pager::close`], which first truncates
//! returned pages that form a contiguous tail of the file, links the rest
//! into the on-disk free list, and then flushes the header and every cached
//! page.

use crate::error::{Result, StorageError};
use crate::page::layout::{
    decode_page_ref, encode_page_ref, FILE_HEADER_SIZE, FREE_PAGE_NEXT_OFFSET, PAGE_SIZE,
};
use crate::page::PageBuf;
use crate::storage::{FileHeader, ReturnedPages};
use crate::types::{PageId, MAX_PAGES};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// File-backed page store with a bounded in-memory cache
pub struct Pager {
    file: File,
    header: FileHeader,
    /// Page cache; a slot is filled when the page is first touched
    pages: Vec<Option<Box<PageBuf>>>,
    /// Number of materialized pages (highest touched page + 1)
    num_pages: usize,
    /// Number of whole pages currently in the file
    num_pages_on_disk: usize,
    /// Next page number to allocate when both free sources are empty
    next_allocatable: u32,
    /// Pages returned during this session
    returned: ReturnedPages,
    /// Head of the on-disk free-page list
    free_list_head: Option<PageId>,
}

impl Pager {
    /// Open or create the database file at `path`.
    ///
    /// A new file gets its header written immediately. An existing file must
    /// carry a valid header and a length of exactly header plus whole pages;
    /// its entire page area is warm-loaded into the cache.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let header = if file_len == 0 {
            let header = FileHeader::new();
            let mut buf = [0u8; FILE_HEADER_SIZE];
            header.write(&mut buf);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.sync_all()?;
            header
        } else {
            if file_len < FILE_HEADER_SIZE as u64
                || (file_len - FILE_HEADER_SIZE as u64) % PAGE_SIZE as u64 != 0
            {
                return Err(StorageError::invalid_db(format!(
                    "file length {file_len} is not a header plus whole pages"
                )));
            }
            let mut buf = [0u8; FILE_HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            FileHeader::read(&buf)?
        };

        let num_pages_on_disk = if file_len == 0 {
            0
        } else {
            ((file_len - FILE_HEADER_SIZE as u64) / PAGE_SIZE as u64) as usize
        };

        let mut pages = Vec::with_capacity(MAX_PAGES);
        pages.resize_with(MAX_PAGES, || None);

        let mut pager = Self {
            file,
            header,
            pages,
            num_pages: num_pages_on_disk,
            num_pages_on_disk,
            next_allocatable: num_pages_on_disk as u32,
            returned: ReturnedPages::new(),
            free_list_head: header.free_list_head,
        };

        // warm the cache with every page already on disk
        for page_num in 0..pager.num_pages_on_disk {
            pager.page(PageId::new(page_num as u32))?;
        }

        Ok(pager)
    }

    /// Fetch the page, materializing it on first touch. Pages past the end
    /// of the file start out zeroed.
    pub fn page(&mut self, page_num: PageId) -> Result<&mut PageBuf> {
        let index = page_num.value() as usize;
        if index >= MAX_PAGES {
            return Err(StorageError::PageOutOfBounds {
                page_num,
                max: MAX_PAGES,
            });
        }

        if self.pages[index].is_none() {
            let mut buf = Box::new(PageBuf::new());
            if index < self.num_pages_on_disk {
                let offset = page_num.file_offset(FILE_HEADER_SIZE, PAGE_SIZE);
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(buf.as_bytes_mut())?;
            }
            self.pages[index] = Some(buf);
            if index >= self.num_pages {
                self.num_pages = index + 1;
            }
            if (self.next_allocatable as usize) < self.num_pages {
                self.next_allocatable = self.num_pages as u32;
            }
        }

        self.pages[index]
            .as_deref_mut()
            .ok_or_else(|| StorageError::corruption("page cache slot empty after load"))
    }

    /// Whether the page has ever been materialized
    pub fn page_exists(&self, page_num: PageId) -> bool {
        (page_num.value() as usize) < self.num_pages
    }

    /// Hand out an unused page number
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if let Some(page_num) = self.returned.pop() {
            debug!("allocate: reusing returned page {page_num}");
            return Ok(page_num);
        }

        if let Some(head) = self.free_list_head {
            let next = {
                let page = self.page(head)?;
                decode_page_ref(page.read_word(FREE_PAGE_NEXT_OFFSET))
            };
            self.free_list_head = next;
            debug!("allocate: reusing on-disk free page {head}");
            return Ok(head);
        }

        let page_num = PageId::new(self.next_allocatable);
        self.next_allocatable += 1;
        debug!("allocate: extending file with page {page_num}");
        Ok(page_num)
    }

    /// Give a page back for reuse. Must never be called on the root of an
    /// open tree.
    pub fn return_page(&mut self, page_num: PageId) {
        debug!("return page {page_num}");
        self.returned.push(page_num);
    }

    /// Flush all state and make the file reopenable.
    ///
    /// Order matters: truncate what can be truncated, persist the remaining
    /// returned pages as free-list nodes, write the header, then flush every
    /// cached page.
    pub fn close(&mut self) -> Result<()> {
        self.truncate_returned_tail()?;

        let mut head = self.free_list_head;
        while let Some(page_num) = self.returned.pop() {
            {
                let page = self.page(page_num)?;
                page.write_word(FREE_PAGE_NEXT_OFFSET, encode_page_ref(head));
            }
            self.flush_page(page_num)?;
            head = Some(page_num);
        }
        self.free_list_head = head;

        self.header.free_list_head = head;
        self.flush_header()?;

        for index in 0..self.num_pages {
            if self.pages[index].is_some() {
                self.flush_page(PageId::new(index as u32))?;
            }
        }

        self.file.sync_all()?;
        Ok(())
    }

    // section: introspection

    /// Number of materialized pages
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Pages currently held on the returned list
    pub fn returned_pages(&self) -> &[PageId] {
        self.returned.as_slice()
    }

    /// Head of the on-disk free-page list
    pub fn free_list_head(&self) -> Option<PageId> {
        self.free_list_head
    }

    /// Walk the on-disk free-page list
    pub fn free_page_list(&mut self) -> Result<Vec<PageId>> {
        let mut free = Vec::new();
        let mut current = self.free_list_head;
        while let Some(page_num) = current {
            if free.len() > MAX_PAGES {
                return Err(StorageError::corruption("free-page list has a cycle"));
            }
            free.push(page_num);
            current = {
                let page = self.page(page_num)?;
                decode_page_ref(page.read_word(FREE_PAGE_NEXT_OFFSET))
            };
        }
        Ok(free)
    }

    // section: internals

    /// Drop returned pages that form a contiguous suffix of the file
    fn truncate_returned_tail(&mut self) -> Result<()> {
        if self.returned.is_empty() || self.num_pages_on_disk == 0 {
            return Ok(());
        }
        self.returned.sort();
        while let Some(page_num) = self.returned.last() {
            let index = page_num.value() as usize;
            if index + 1 == self.num_pages && index + 1 == self.num_pages_on_disk {
                self.returned.pop();
                self.pages[index] = None;
                self.num_pages -= 1;
                self.num_pages_on_disk -= 1;
                let new_len =
                    FILE_HEADER_SIZE as u64 + (self.num_pages_on_disk * PAGE_SIZE) as u64;
                self.file.set_len(new_len)?;
                debug!("truncated page {page_num} off the file tail");
            } else {
                break;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self, page_num: PageId) -> Result<()> {
        let index = page_num.value() as usize;
        let offset = page_num.file_offset(FILE_HEADER_SIZE, PAGE_SIZE);
        let buf = self.pages[index]
            .as_deref()
            .ok_or_else(|| StorageError::corruption(format!("flush of unmaterialized page {page_num}")))?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf.as_bytes())?;
        if index >= self.num_pages_on_disk {
            self.num_pages_on_disk = index + 1;
        }
        Ok(())
    }

    fn flush_header(&mut self) -> Result<()> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        self.header.write(&mut buf);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_new_database() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Pager::open(&path)?;
        assert_eq!(pager.num_pages(), 0);
        assert_eq!(pager.free_list_head(), None);

        // header alone is on disk
        assert_eq!(std::fs::metadata(&path).unwrap().len(), FILE_HEADER_SIZE as u64);
        Ok(())
    }

    #[test]
    fn test_page_roundtrip_across_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = Pager::open(&path)?;
            let page_num = pager.allocate_page()?;
            assert_eq!(page_num, PageId::new(0));
            pager.page(page_num)?.write_word(0, 0xABCD);
            pager.close()?;
        }

        {
            let mut pager = Pager::open(&path)?;
            assert_eq!(pager.num_pages(), 1);
            assert_eq!(pager.page(PageId::new(0))?.read_word(0), 0xABCD);
        }
        Ok(())
    }

    #[test]
    fn test_allocation_is_dense_and_lifo() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut pager = Pager::open(&path)?;

        let p0 = pager.allocate_page()?;
        let p1 = pager.allocate_page()?;
        let p2 = pager.allocate_page()?;
        assert_eq!((p0, p1, p2), (PageId::new(0), PageId::new(1), PageId::new(2)));

        pager.return_page(p1);
        pager.return_page(p2);
        // most recently returned page comes back first
        assert_eq!(pager.allocate_page()?, p2);
        assert_eq!(pager.allocate_page()?, p1);
        assert_eq!(pager.allocate_page()?, PageId::new(3));
        Ok(())
    }

    #[test]
    fn test_close_truncates_trailing_returned_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = Pager::open(&path)?;
            for n in 0..4 {
                let page_num = pager.allocate_page()?;
                pager.page(page_num)?.write_word(0, n);
            }
            pager.close()?;
        }
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (FILE_HEADER_SIZE + 4 * PAGE_SIZE) as u64
        );

        {
            let mut pager = Pager::open(&path)?;
            pager.return_page(PageId::new(3));
            pager.return_page(PageId::new(2));
            pager.close()?;
        }
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (FILE_HEADER_SIZE + 2 * PAGE_SIZE) as u64
        );
        Ok(())
    }

    #[test]
    fn test_free_list_persists_across_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let mut pager = Pager::open(&path)?;
            for n in 0..3 {
                let page_num = pager.allocate_page()?;
                pager.page(page_num)?.write_word(0, n);
            }
            // returning a non-tail page forces it onto the on-disk list
            pager.return_page(PageId::new(1));
            pager.close()?;
        }

        {
            let mut pager = Pager::open(&path)?;
            assert_eq!(pager.free_list_head(), Some(PageId::new(1)));
            assert_eq!(pager.free_page_list()?, vec![PageId::new(1)]);
            // free-list page is reused before the file grows
            assert_eq!(pager.allocate_page()?, PageId::new(1));
            assert_eq!(pager.free_list_head(), None);
            assert_eq!(pager.allocate_page()?, PageId::new(3));
        }
        Ok(())
    }

    #[test]
    fn test_page_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut pager = Pager::open(&path).unwrap();

        let result = pager.page(PageId::new(MAX_PAGES as u32));
        assert!(matches!(result, Err(StorageError::PageOutOfBounds { .. })));
    }

    #[test]
    fn test_corrupt_length_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let mut pager = Pager::open(&path).unwrap();
            let page_num = pager.allocate_page().unwrap();
            pager.page(page_num).unwrap();
            pager.close().unwrap();
        }
        // chop off part of the page area
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((FILE_HEADER_SIZE + PAGE_SIZE / 2) as u64).unwrap();
        drop(file);

        assert!(matches!(
            Pager::open(&path),
            Err(StorageError::InvalidDatabaseFile(_))
        ));
    }
}
