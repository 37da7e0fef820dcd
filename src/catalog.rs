//! Tenant/table → root-page map. A B+Tree keyed by `tenant \0 table`
//! whose root id lives in the superblock, guarded by an internal
//! readers-writer lock over the cached tree handle.

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::pager::Pager;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_tag: u8,
    pub constraint_tag: u8,
    pub foreign_key_ref: Option<String>,
    pub pointer_table_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub root: u32,
    pub columns: Vec<ColumnDef>,
    pub row_count: u64,
    pub version: u64,
}

fn make_key(tenant: &str, table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tenant.len() + 1 + table.len());
    key.extend_from_slice(tenant.as_bytes());
    key.push(0);
    key.extend_from_slice(table.as_bytes());
    key
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn decode_string(bytes: &[u8], pos: &mut usize) -> Result<String> {
    if *pos + 2 > bytes.len() {
        return Err(Error::Corrupted("truncated catalog string length"));
    }
    let len = u16::from_le_bytes(bytes[*pos..*pos + 2].try_into().unwrap()) as usize;
    *pos += 2;
    if *pos + len > bytes.len() {
        return Err(Error::Corrupted("truncated catalog string"));
    }
    let s = String::from_utf8(bytes[*pos..*pos + len].to_vec())
        .map_err(|_| Error::Corrupted("non-utf8 catalog string"))?;
    *pos += len;
    Ok(s)
}

pub fn encode_entry(entry: &CatalogEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&entry.root.to_le_bytes());
    out.extend_from_slice(&entry.row_count.to_le_bytes());
    out.extend_from_slice(&entry.version.to_le_bytes());
    out.extend_from_slice(&(entry.columns.len() as u16).to_le_bytes());
    for col in &entry.columns {
        encode_string(&mut out, &col.name);
        out.push(col.type_tag);
        out.push(col.constraint_tag);
        let flags =
            (col.foreign_key_ref.is_some() as u8) | ((col.pointer_table_ref.is_some() as u8) << 1);
        out.push(flags);
        if let Some(fk) = &col.foreign_key_ref {
            encode_string(&mut out, fk);
        }
        if let Some(ptr) = &col.pointer_table_ref {
            encode_string(&mut out, ptr);
        }
    }
    out
}

pub fn decode_entry(bytes: &[u8]) -> Result<CatalogEntry> {
    if bytes.len() < 4 + 8 + 8 + 2 {
        return Err(Error::Corrupted("truncated catalog entry"));
    }
    let root = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let row_count = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    let version = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
    let column_count = u16::from_le_bytes(bytes[20..22].try_into().unwrap()) as usize;
    let mut pos = 22;
    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let name = decode_string(bytes, &mut pos)?;
        if pos + 3 > bytes.len() {
            return Err(Error::Corrupted("truncated catalog column"));
        }
        let type_tag = bytes[pos];
        let constraint_tag = bytes[pos + 1];
        let flags = bytes[pos + 2];
        pos += 3;
        let foreign_key_ref = if flags & 0x1 != 0 {
            Some(decode_string(bytes, &mut pos)?)
        } else {
            None
        };
        let pointer_table_ref = if flags & 0x2 != 0 {
            Some(decode_string(bytes, &mut pos)?)
        } else {
            None
        };
        columns.push(ColumnDef {
            name,
            type_tag,
            constraint_tag,
            foreign_key_ref,
            pointer_table_ref,
        });
    }
    Ok(CatalogEntry {
        root,
        columns,
        row_count,
        version,
    })
}

pub struct Catalog {
    tree: RwLock<Option<BTree>>,
}

impl Catalog {
    /// Wraps the catalog tree already pointed to by the superblock, if
    /// any; the tree itself is created lazily on the first write.
    pub fn open(pager: &Pager) -> Self {
        let root = pager.catalog_root();
        let tree = if root.is_invalid() {
            None
        } else {
            Some(BTree::open(root))
        };
        Catalog {
            tree: RwLock::new(tree),
        }
    }

    fn ensure_tree(&self, pager: &Pager, tx: u64) -> Result<BTree> {
        let mut guard = self.tree.write().unwrap();
        if let Some(tree) = *guard {
            return Ok(tree);
        }
        let tree = BTree::create(pager, tx)?;
        pager.set_catalog_root(tree.root());
        *guard = Some(tree);
        Ok(tree)
    }

    pub fn put_entry(
        &self,
        pager: &Pager,
        tx: u64,
        tenant: &str,
        table: &str,
        entry: &CatalogEntry,
    ) -> Result<()> {
        let mut tree = self.ensure_tree(pager, tx)?;
        tree.insert(pager, tx, &make_key(tenant, table), &encode_entry(entry))?;
        pager.set_catalog_root(tree.root());
        *self.tree.write().unwrap() = Some(tree);
        Ok(())
    }

    pub fn get_entry(&self, pager: &Pager, tenant: &str, table: &str) -> Result<Option<CatalogEntry>> {
        let tree = match *self.tree.read().unwrap() {
            Some(tree) => tree,
            None => return Ok(None),
        };
        match tree.get(pager, &make_key(tenant, table))? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_entry(&self, pager: &Pager, tx: u64, tenant: &str, table: &str) -> Result<bool> {
        let tree = match *self.tree.read().unwrap() {
            Some(tree) => tree,
            None => return Ok(false),
        };
        tree.delete(pager, tx, &make_key(tenant, table))
    }

    pub fn list_tables(&self, pager: &Pager, tenant: &str) -> Result<Vec<String>> {
        let tree = match *self.tree.read().unwrap() {
            Some(tree) => tree,
            None => return Ok(Vec::new()),
        };
        let prefix = {
            let mut p = tenant.as_bytes().to_vec();
            p.push(0);
            p
        };
        let mut names = Vec::new();
        tree.scan_range(pager, &prefix, None, |key, _| {
            if !key.starts_with(&prefix) {
                return false;
            }
            if let Ok(name) = std::str::from_utf8(&key[prefix.len()..]) {
                names.push(name.to_string());
            }
            true
        })?;
        Ok(names)
    }

    pub fn root(&self) -> crate::pager::PageId {
        match *self.tree.read().unwrap() {
            Some(tree) => tree.root(),
            None => crate::pager::PageId::INVALID,
        }
    }
}
