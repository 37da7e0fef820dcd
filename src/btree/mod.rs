//! On-disk B+Tree: search, insert with split, delete, range scan.

pub mod page;

use crate::error::{Error, Result};
use crate::overflow;
use crate::pager::{PageId, Pager};
use page::{InternalEntry, LeafEntry, LeafValue};

/// A handle to one B+Tree, identified by its root page id. Cheap to
/// copy; the tree's actual state lives in the pager's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTree {
    root: PageId,
}

impl BTree {
    /// Allocates a single (empty) leaf page as the tree's root.
    pub fn create(pager: &Pager, tx: u64) -> Result<Self> {
        let id = pager.alloc_page(tx)?;
        let buf = page::new_leaf(pager.page_size(), id.as_u32());
        pager.write_page(tx, id, buf)?;
        Ok(BTree { root: id })
    }

    /// Wraps an existing tree whose root is already `root`.
    pub fn open(root: PageId) -> Self {
        BTree { root }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Descends from the root to the leaf that would contain `key`.
    fn find_leaf(&self, pager: &Pager, key: &[u8]) -> Result<PageId> {
        let mut cur = self.root;
        loop {
            let buf = pager.read_page(cur)?;
            if page::is_leaf(&buf) {
                return Ok(cur);
            }
            let child = page::internal_child_for_key(&buf, key)?;
            cur = PageId::new(child);
        }
    }

    fn read_value(&self, pager: &Pager, value: &LeafValue) -> Result<Vec<u8>> {
        match value {
            LeafValue::Inline(v) => Ok(v.clone()),
            LeafValue::Overflow {
                page_id,
                total_size,
            } => overflow::read_chain(*page_id, *total_size as usize, |id| {
                pager.read_page(PageId::new(id))
            }),
        }
    }

    /// Looks up `key`, reassembling an overflow chain if needed.
    pub fn get(&self, pager: &Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf_id = self.find_leaf(pager, key)?;
        let buf = pager.read_page(leaf_id)?;
        let entries = page::leaf_entries(&buf)?;
        match page::leaf_lower_bound(&entries, key) {
            Ok(pos) => Ok(Some(self.read_value(pager, &entries[pos].value)?)),
            Err(_) => Ok(None),
        }
    }

    fn free_value_chain(&self, pager: &Pager, tx: u64, value: &LeafValue) -> Result<()> {
        if let LeafValue::Overflow { page_id, .. } = value {
            let mut seen = std::collections::HashSet::new();
            let mut next = *page_id;
            while next != 0 {
                if !seen.insert(next) {
                    return Err(Error::Corrupted("overflow chain cycle on free"));
                }
                let buf = pager.read_page(PageId::new(next))?;
                let following = overflow::next_overflow(&buf);
                pager.free_page(tx, PageId::new(next))?;
                next = following;
            }
        }
        Ok(())
    }

    fn store_value(&self, pager: &Pager, tx: u64, value: &[u8]) -> Result<LeafValue> {
        if value.len() <= pager.overflow_threshold() {
            return Ok(LeafValue::Inline(value.to_vec()));
        }
        let page_size = pager.page_size();
        let (head, pages) = overflow::write_chain(value, page_size, || {
            let id = pager.alloc_page(tx)?;
            Ok((id.as_u32(), crate::page::new_page(page_size, crate::page::PageType::Overflow, id.as_u32())))
        })?;
        for buf in pages {
            let id = PageId::new(crate::page::page_id(&buf));
            pager.write_page(tx, id, buf)?;
        }
        Ok(LeafValue::Overflow {
            page_id: head,
            total_size: value.len() as u32,
        })
    }

    /// Inserts or updates `key` with `value`. Values over the pager's
    /// overflow threshold are promoted to an overflow chain. Splits
    /// propagate up to the root, creating a new root if needed.
    pub fn insert(&mut self, pager: &Pager, tx: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let new_value = self.store_value(pager, tx, value)?;

        let mut path = Vec::new();
        let mut cur = self.root;
        loop {
            let buf = pager.read_page(cur)?;
            if page::is_leaf(&buf) {
                break;
            }
            let child = page::internal_child_for_key(&buf, key)?;
            path.push(cur);
            cur = PageId::new(child);
        }
        let leaf_id = cur;

        let buf = pager.read_page(leaf_id)?;
        let mut entries = page::leaf_entries(&buf)?;
        match page::leaf_lower_bound(&entries, key) {
            Ok(pos) => {
                self.free_value_chain(pager, tx, &entries[pos].value.clone())?;
                entries[pos] = LeafEntry {
                    key: key.to_vec(),
                    value: new_value,
                };
            }
            Err(pos) => entries.insert(
                pos,
                LeafEntry {
                    key: key.to_vec(),
                    value: new_value,
                },
            ),
        }

        if page::leaf_fits(pager.page_size(), &entries) {
            let mut buf = buf;
            page::rebuild_leaf(&mut buf, &entries)?;
            pager.write_page(tx, leaf_id, buf)?;
            return Ok(());
        }

        let split_at = entries.len() - entries.len().div_ceil(2);
        let (left, right) = entries.split_at(split_at);
        let (left, right) = (left.to_vec(), right.to_vec());
        let separator = right[0].key.clone();

        let right_id = pager.alloc_page(tx)?;
        let old_next = page::next_leaf(&buf);

        let mut left_buf = buf;
        let mut right_buf = page::new_leaf(pager.page_size(), right_id.as_u32());
        page::set_prev_leaf(&mut right_buf, leaf_id.as_u32());
        page::set_next_leaf(&mut right_buf, old_next);
        page::rebuild_leaf(&mut right_buf, &right)?;

        page::set_next_leaf(&mut left_buf, right_id.as_u32());
        page::rebuild_leaf(&mut left_buf, &left)?;

        pager.write_page(tx, leaf_id, left_buf)?;
        pager.write_page(tx, right_id, right_buf)?;

        if !PageId::new(old_next).is_invalid() {
            let mut next_buf = pager.read_page(PageId::new(old_next))?;
            page::set_prev_leaf(&mut next_buf, right_id.as_u32());
            pager.write_page(tx, PageId::new(old_next), next_buf)?;
        }

        self.propagate_split(pager, tx, path, leaf_id, right_id, separator)
    }

    /// Propagates a child split up `path` (root-most last), inserting
    /// the new separator and splitting ancestors as needed.
    fn propagate_split(
        &mut self,
        pager: &Pager,
        tx: u64,
        mut path: Vec<PageId>,
        mut old_child: PageId,
        mut new_right: PageId,
        mut separator: Vec<u8>,
    ) -> Result<()> {
        loop {
            let Some(parent_id) = path.pop() else {
                let new_root_id = pager.alloc_page(tx)?;
                let mut new_root = page::new_internal(pager.page_size(), new_root_id.as_u32());
                page::rebuild_internal(
                    &mut new_root,
                    &[InternalEntry {
                        child: old_child.as_u32(),
                        key: separator,
                    }],
                    new_right.as_u32(),
                )?;
                pager.write_page(tx, new_root_id, new_root)?;
                self.root = new_root_id;
                return Ok(());
            };

            let buf = pager.read_page(parent_id)?;
            let mut entries = page::internal_entries(&buf)?;
            let mut right_child = page::right_child(&buf);
            if right_child == old_child.as_u32() {
                right_child = new_right.as_u32();
            } else {
                for e in entries.iter_mut() {
                    if e.child == old_child.as_u32() {
                        e.child = new_right.as_u32();
                    }
                }
            }
            let pos = entries
                .binary_search_by(|e| e.key.as_slice().cmp(&separator))
                .unwrap_or_else(|p| p);
            entries.insert(
                pos,
                InternalEntry {
                    child: old_child.as_u32(),
                    key: separator.clone(),
                },
            );

            if page::internal_fits(pager.page_size(), &entries) {
                let mut buf = buf;
                page::rebuild_internal(&mut buf, &entries, right_child)?;
                pager.write_page(tx, parent_id, buf)?;
                return Ok(());
            }

            let mid = entries.len() / 2;
            let promoted = entries[mid].key.clone();
            let left_right_child = entries[mid].child;
            let left_entries = entries[..mid].to_vec();
            let right_entries = entries[mid + 1..].to_vec();

            let new_internal_id = pager.alloc_page(tx)?;
            let mut left_buf = buf;
            page::rebuild_internal(&mut left_buf, &left_entries, left_right_child)?;
            let mut right_buf = page::new_internal(pager.page_size(), new_internal_id.as_u32());
            page::rebuild_internal(&mut right_buf, &right_entries, right_child)?;

            pager.write_page(tx, parent_id, left_buf)?;
            pager.write_page(tx, new_internal_id, right_buf)?;

            old_child = parent_id;
            new_right = new_internal_id;
            separator = promoted;
        }
    }

    /// Deletes `key` and any overflow chain it owned. No underflow
    /// rebalancing: a leaf may shrink to zero keys and stays linked.
    pub fn delete(&self, pager: &Pager, tx: u64, key: &[u8]) -> Result<bool> {
        let leaf_id = self.find_leaf(pager, key)?;
        let mut buf = pager.read_page(leaf_id)?;
        let mut entries = page::leaf_entries(&buf)?;
        let Ok(pos) = page::leaf_lower_bound(&entries, key) else {
            return Ok(false);
        };
        let removed = entries.remove(pos);
        self.free_value_chain(pager, tx, &removed.value)?;
        page::rebuild_leaf(&mut buf, &entries)?;
        pager.write_page(tx, leaf_id, buf)?;
        Ok(true)
    }

    /// Walks leaves left-to-right yielding entries with `start_key <=
    /// key` and, if `end_key` is set, `key <= end_key`. Stops early if
    /// `visitor` returns `false`.
    pub fn scan_range(
        &self,
        pager: &Pager,
        start_key: &[u8],
        end_key: Option<&[u8]>,
        mut visitor: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let mut leaf_id = self.find_leaf(pager, start_key)?;
        loop {
            let buf = pager.read_page(leaf_id)?;
            let entries = page::leaf_entries(&buf)?;
            for entry in &entries {
                if entry.key.as_slice() < start_key {
                    continue;
                }
                if let Some(end) = end_key {
                    if entry.key.as_slice() > end {
                        return Ok(());
                    }
                }
                let value = self.read_value(pager, &entry.value)?;
                if !visitor(&entry.key, &value) {
                    return Ok(());
                }
            }
            let next = page::next_leaf(&buf);
            if next == 0 {
                return Ok(());
            }
            leaf_id = PageId::new(next);
        }
    }

    pub fn count(&self, pager: &Pager) -> Result<u64> {
        let mut n = 0u64;
        self.scan_range(pager, &[], None, |_, _| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    /// Frees every page (internal, leaf, and owned overflow chains)
    /// belonging to this tree. Used when dropping a table.
    pub fn free_all_pages(&self, pager: &Pager, tx: u64) -> Result<()> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let buf = pager.read_page(id)?;
            if page::is_leaf(&buf) {
                for entry in page::leaf_entries(&buf)? {
                    self.free_value_chain(pager, tx, &entry.value)?;
                }
            } else {
                for entry in page::internal_entries(&buf)? {
                    stack.push(PageId::new(entry.child));
                }
                stack.push(PageId::new(page::right_child(&buf)));
            }
            pager.free_page(tx, id)?;
        }
        Ok(())
    }
}
