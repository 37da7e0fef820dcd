//! Higher-level table operations consumed by the executor and the
//! import/export adapters: load/save/delete a whole table's rows in
//! one transaction, keyed by insertion order.

use crate::btree::BTree;
use crate::catalog::{Catalog, CatalogEntry, ColumnDef};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::pager::{PageId, Pager};
use crate::row::{self, Value};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    pub version: u64,
}

/// Owns a pager and its catalog. Writers (`save_table`/`delete_table`)
/// take an exclusive lock; readers share it, mirroring the teacher's
/// `RwLock`-guarded published-snapshot pattern.
pub struct TableBackend {
    pager: Pager,
    catalog: Catalog,
    guard: RwLock<()>,
}

impl TableBackend {
    pub fn open(config: StorageConfig) -> Result<Self> {
        let pager = Pager::open(config)?;
        let catalog = Catalog::open(&pager);
        Ok(TableBackend {
            pager,
            catalog,
            guard: RwLock::new(()),
        })
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn load_table(&self, tenant: &str, name: &str) -> Result<Option<LoadedTable>> {
        let _guard = self.guard.read().unwrap();
        let entry = match self.catalog.get_entry(&self.pager, tenant, name)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let tree = BTree::open(PageId::new(entry.root));
        let mut rows = Vec::with_capacity(entry.row_count as usize);
        tree.scan_range(&self.pager, &[], None, |_, value| {
            if let Ok(row) = row::unmarshal_row(value) {
                rows.push(row);
            }
            true
        })?;
        Ok(Some(LoadedTable {
            name: name.to_string(),
            columns: entry.columns,
            rows,
            version: entry.version,
        }))
    }

    /// Replaces a table's prior contents atomically: frees the old
    /// tree (if any), builds a fresh one keyed by row ordinal, and
    /// upserts the catalog entry with an incremented version.
    pub fn save_table(
        &self,
        tenant: &str,
        name: &str,
        columns: Vec<ColumnDef>,
        rows: &[Vec<Value>],
    ) -> Result<()> {
        let _guard = self.guard.write().unwrap();
        let tx = self.pager.begin_tx()?;

        let old = self.catalog.get_entry(&self.pager, tenant, name)?;
        if let Some(old) = &old {
            BTree::open(PageId::new(old.root)).free_all_pages(&self.pager, tx)?;
        }

        let mut tree = BTree::create(&self.pager, tx)?;
        for (i, row) in rows.iter().enumerate() {
            let key = row::row_key(i as u64);
            let bytes = row::marshal_row(row);
            tree.insert(&self.pager, tx, &key, &bytes)?;
        }

        let version = old.map(|o| o.version + 1).unwrap_or(1);
        let entry = CatalogEntry {
            root: tree.root().as_u32(),
            columns,
            row_count: rows.len() as u64,
            version,
        };
        self.catalog.put_entry(&self.pager, tx, tenant, name, &entry)?;
        self.pager.commit_tx(tx)?;
        Ok(())
    }

    pub fn delete_table(&self, tenant: &str, name: &str) -> Result<bool> {
        let _guard = self.guard.write().unwrap();
        let tx = self.pager.begin_tx()?;
        let entry = match self.catalog.get_entry(&self.pager, tenant, name)? {
            Some(entry) => entry,
            None => {
                self.pager.abort_tx(tx)?;
                return Ok(false);
            }
        };
        BTree::open(PageId::new(entry.root)).free_all_pages(&self.pager, tx)?;
        let deleted = self.catalog.delete_entry(&self.pager, tx, tenant, name)?;
        self.pager.commit_tx(tx)?;
        Ok(deleted)
    }

    pub fn list_table_names(&self, tenant: &str) -> Result<Vec<String>> {
        let _guard = self.guard.read().unwrap();
        self.catalog.list_tables(&self.pager, tenant)
    }

    pub fn table_exists(&self, tenant: &str, name: &str) -> Result<bool> {
        let _guard = self.guard.read().unwrap();
        Ok(self.catalog.get_entry(&self.pager, tenant, name)?.is_some())
    }

    pub fn sync(&self) -> Result<()> {
        self.pager.checkpoint()
    }

    pub fn close(self) -> Result<()> {
        self.pager.close()
    }

    pub fn stats(&self) -> crate::stats::Stats {
        crate::stats::collect(&self.pager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> TableBackend {
        let config = StorageConfig::new(dir.path().join("t.db"))
            .with_page_size(4096)
            .unwrap();
        TableBackend::open(config).unwrap()
    }

    fn columns() -> Vec<ColumnDef> {
        vec![ColumnDef {
            name: "n".to_string(),
            type_tag: 2,
            constraint_tag: 0,
            foreign_key_ref: None,
            pointer_table_ref: None,
        }]
    }

    #[test]
    fn save_then_load_preserves_row_order() {
        let dir = tempdir().unwrap();
        let backend = open(&dir);
        let rows: Vec<Vec<Value>> = (0..20).map(|i| vec![Value::Number(i as f64)]).collect();
        backend.save_table("acme", "nums", columns(), &rows).unwrap();

        let loaded = backend.load_table("acme", "nums").unwrap().unwrap();
        assert_eq!(loaded.rows, rows);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn resave_frees_old_tree_and_bumps_version() {
        let dir = tempdir().unwrap();
        let backend = open(&dir);
        backend
            .save_table("acme", "t", columns(), &[vec![Value::Number(1.0)]])
            .unwrap();
        backend
            .save_table(
                "acme",
                "t",
                columns(),
                &[vec![Value::Number(2.0)], vec![Value::Number(3.0)]],
            )
            .unwrap();

        let loaded = backend.load_table("acme", "t").unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.rows.len(), 2);
    }

    #[test]
    fn delete_removes_entry_and_rows_become_unreachable() {
        let dir = tempdir().unwrap();
        let backend = open(&dir);
        backend
            .save_table("acme", "t", columns(), &[vec![Value::Number(1.0)]])
            .unwrap();
        assert!(backend.delete_table("acme", "t").unwrap());
        assert!(backend.load_table("acme", "t").unwrap().is_none());
        assert!(!backend.delete_table("acme", "t").unwrap());
    }

    #[test]
    fn list_and_exists_reflect_catalog() {
        let dir = tempdir().unwrap();
        let backend = open(&dir);
        backend.save_table("acme", "a", columns(), &[]).unwrap();
        backend.save_table("acme", "b", columns(), &[]).unwrap();

        assert!(backend.table_exists("acme", "a").unwrap());
        assert!(!backend.table_exists("acme", "missing").unwrap());
        let mut names = backend.list_table_names("acme").unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
