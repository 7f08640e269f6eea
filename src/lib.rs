//! # slotdb
//!
//! The storage engine core of a single-file relational database: a pager
//! over fixed-size pages and a B+tree per table built on top of it, with a
//! catalog tree at page 0 mapping table names to tree roots.
//!
//! ## Architecture
//!
//! - **Page layer** (`page`): slotted leaf and internal node layouts with
//!   typed accessors; the wire format lives in `page::layout`.
//! - **Storage layer** (`storage`): the pager owning the database file, the
//!   page cache, and both free-page mechanisms.
//! - **B+tree layer** (`btree`): key-ordered insert/find/delete with
//!   out-of-place splits, compaction on underflow, cursors and validators.
//! - **Catalog** (`catalog`): table-name to root-page mapping stored as
//!   ordinary cells in the tree at page 0.
//!
//! Higher layers (SQL parsing, the query VM, record serde) sit outside this
//! crate and speak to it through opaque cells with a documented prefix.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use slotdb::{Db, page::cell};
//!
//! let mut db = Db::open("my_database.db")?;
//! db.create_table("customers", "create table customers (id integer primary key)")?;
//!
//! let tree = db.tree("customers")?;
//! tree.insert(&cell::build_cell(1, b"serialized row"))?;
//! let rows = tree.scan()?;
//!
//! db.close()?;
//! ```

pub mod btree;
pub mod catalog;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

pub use btree::{Cursor, Tree};
pub use catalog::TableRecord;
pub use error::{Result, StorageError};
pub use storage::Pager;
pub use types::PageId;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One registered user table
struct TableHandle {
    pkey: u32,
    tree: Tree,
    sql_text: String,
}

/// Engine handle over one database file.
///
/// Opening walks the catalog tree and registers a [`Tree`] per table.
/// Nothing is durable until [`Db::close`] returns.
pub struct Db {
    pager: Arc<RwLock<Pager>>,
    catalog: Tree,
    tables: HashMap<String, TableHandle>,
    next_pkey: u32,
}

impl Db {
    /// Open or create the database at `path` and load the table registry
    /// from the catalog
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let pager = Arc::new(RwLock::new(Pager::open(path.as_ref())?));
        let catalog = Tree::open(Arc::clone(&pager), PageId::CATALOG_ROOT)?;

        let mut tables = HashMap::new();
        let mut next_pkey = 1;
        let mut cursor = Cursor::new(&catalog)?;
        while !cursor.at_end() {
            let (pkey, record) = catalog::decode_row(&cursor.cell()?)?;
            let tree = Tree::open(Arc::clone(&pager), PageId::new(record.root_page_num))?;
            next_pkey = next_pkey.max(pkey + 1);
            tables.insert(
                record.name.clone(),
                TableHandle {
                    pkey,
                    tree,
                    sql_text: record.sql_text,
                },
            );
            cursor.advance()?;
        }

        Ok(Self {
            pager,
            catalog,
            tables,
            next_pkey,
        })
    }

    /// Flush all state; the file becomes valid and reopenable
    pub fn close(self) -> Result<()> {
        self.pager.write().close()
    }

    /// Create a table: allocate a root page, register the tree, and record
    /// it in the catalog
    pub fn create_table(&mut self, name: &str, sql_text: &str) -> Result<()> {
        if self.tables.contains_key(name) {
            return Err(StorageError::TableExists(name.to_string()));
        }

        let root = self.pager.write().allocate_page()?;
        let tree = Tree::create(Arc::clone(&self.pager), root)?;

        let pkey = self.next_pkey;
        self.next_pkey += 1;
        let record = TableRecord {
            name: name.to_string(),
            root_page_num: root.value(),
            sql_text: sql_text.to_string(),
        };
        self.catalog.insert(&catalog::encode_row(pkey, &record)?)?;

        self.tables.insert(
            name.to_string(),
            TableHandle {
                pkey,
                tree,
                sql_text: sql_text.to_string(),
            },
        );
        Ok(())
    }

    /// Drop a table: remove its catalog row and return every page of its
    /// tree to the pager
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let handle = self
            .tables
            .remove(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;

        self.catalog.delete(handle.pkey)?;

        let pages = handle.tree.all_pages()?;
        let pager = &mut *self.pager.write();
        for page in pages {
            pager.return_page(page);
        }
        Ok(())
    }

    /// Tree of a registered table
    pub fn tree(&self, name: &str) -> Result<&Tree> {
        self.tables
            .get(name)
            .map(|handle| &handle.tree)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    /// DDL text recorded for a registered table
    pub fn table_sql(&self, name: &str) -> Result<&str> {
        self.tables
            .get(name)
            .map(|handle| handle.sql_text.as_str())
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    /// Names of every registered table, unordered
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|name| name.as_str()).collect()
    }

    /// The catalog tree itself
    pub fn catalog(&self) -> &Tree {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::cell::build_cell;
    use tempfile::tempdir;

    #[test]
    fn test_create_table_insert_and_scan() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = Db::open(&path)?;

        db.create_table("t", "create table t (id integer primary key, name text)")?;
        let tree = db.tree("t")?;
        for key in [1, 2, 3, 4] {
            tree.insert(&build_cell(key, format!("name-{key}").as_bytes()))?;
        }

        let keys: Vec<u32> = tree.scan()?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        tree.validate()?;
        db.catalog().validate()?;
        Ok(())
    }

    #[test]
    fn test_tables_survive_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let sql = "create table users (id integer primary key, email text)";

        {
            let mut db = Db::open(&path)?;
            db.create_table("users", sql)?;
            db.create_table("orders", "create table orders (id integer primary key)")?;

            let users = db.tree("users")?;
            for key in [10, 20, 30, 5, 40] {
                users.insert(&build_cell(key, b"row"))?;
            }
            db.close()?;
        }

        {
            let db = Db::open(&path)?;
            let mut names = db.table_names();
            names.sort_unstable();
            assert_eq!(names, vec!["orders", "users"]);
            assert_eq!(db.table_sql("users")?, sql);

            let users = db.tree("users")?;
            users.validate()?;
            let keys: Vec<u32> = users.scan()?.into_iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec![5, 10, 20, 30, 40]);
            db.close()?;
        }
        Ok(())
    }

    #[test]
    fn test_table_registry_errors() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut db = Db::open(&dir.path().join("test.db"))?;

        db.create_table("t", "create table t (id integer primary key)")?;
        assert!(matches!(
            db.create_table("t", "create table t (id integer primary key)"),
            Err(StorageError::TableExists(_))
        ));
        assert!(matches!(db.tree("missing"), Err(StorageError::TableNotFound(_))));
        assert!(matches!(
            db.drop_table("missing"),
            Err(StorageError::TableNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_drop_table_recycles_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let mut db = Db::open(&dir.path().join("test.db"))?;

        db.create_table("big", "create table big (id integer primary key)")?;
        {
            let tree = db.tree("big")?;
            for key in [159, 597, 520, 189, 822, 725, 504, 397, 218, 134, 516] {
                tree.insert(&build_cell(key, b"row"))?;
            }
        }
        let dropped_pages = db.tree("big")?.all_pages()?;
        assert!(dropped_pages.len() > 1);

        db.drop_table("big")?;
        assert!(matches!(db.tree("big"), Err(StorageError::TableNotFound(_))));

        // the dropped table's pages feed subsequent allocations
        db.create_table("next", "create table next (id integer primary key)")?;
        let new_root = db.tree("next")?.root_page_num();
        assert!(dropped_pages.contains(&new_root));
        Ok(())
    }

    #[test]
    fn test_tables_share_the_file_without_interference() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let mut db = Db::open(&path)?;

        db.create_table("a", "create table a (id integer primary key)")?;
        db.create_table("b", "create table b (id integer primary key)")?;

        for key in 1..=10 {
            db.tree("a")?.insert(&build_cell(key, b"a-row"))?;
            db.tree("b")?.insert(&build_cell(key * 100, b"b-row"))?;
        }
        for key in [2, 4, 6] {
            db.tree("a")?.delete(key)?;
        }

        db.tree("a")?.validate()?;
        db.tree("b")?.validate()?;

        let a_keys: Vec<u32> = db.tree("a")?.scan()?.into_iter().map(|(k, _)| k).collect();
        let b_keys: Vec<u32> = db.tree("b")?.scan()?.into_iter().map(|(k, _)| k).collect();
        assert_eq!(a_keys, vec![1, 3, 5, 7, 8, 9, 10]);
        assert_eq!(b_keys, (1..=10).map(|k| k * 100).collect::<Vec<u32>>());
        Ok(())
    }
}
