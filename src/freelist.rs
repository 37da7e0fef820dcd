//! In-memory set of reusable page ids, persisted as a page-id chain at
//! each checkpoint.
//!
//! On-disk page layout: `next_freelist (u32) | entry_count (u32) |
//! page_ids[]`, each id a little-endian `u32`.

use crate::error::Result;
use crate::page::{self, PageBuf, PageType};
use std::collections::HashSet;

const OFF_NEXT: usize = page::HEADER_SIZE;
const OFF_ENTRY_COUNT: usize = OFF_NEXT + 4;
const OFF_ENTRIES: usize = OFF_ENTRY_COUNT + 4;

/// Max page ids a single free-list page can hold.
pub fn entries_per_page(page_size: u32) -> usize {
    (page_size as usize - OFF_ENTRIES) / 4
}

/// The in-memory free set. Unordered; `alloc` pops an arbitrary id.
#[derive(Debug, Default)]
pub struct FreeManager {
    free: HashSet<u32>,
}

impl FreeManager {
    pub fn new() -> Self {
        Self {
            free: HashSet::new(),
        }
    }

    /// Pops an arbitrary free page id, or `None` if the set is empty.
    pub fn alloc(&mut self) -> Option<u32> {
        let id = *self.free.iter().next()?;
        self.free.remove(&id);
        Some(id)
    }

    pub fn free(&mut self, page_id: u32) {
        self.free.insert(page_id);
    }

    pub fn count(&self) -> usize {
        self.free.len()
    }

    pub fn all_free(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.free.iter().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn contains(&self, page_id: u32) -> bool {
        self.free.contains(&page_id)
    }

    /// Number of chain pages needed to persist the current free set.
    /// Callers allocate exactly this many page ids (reusing free ids
    /// themselves where possible) before calling [`Self::flush_to_disk`].
    pub fn chain_page_count(&self, page_size: u32) -> usize {
        let per_page = entries_per_page(page_size).max(1);
        (self.free.len() + per_page - 1) / per_page
    }

    /// Writes the current free set out as a fresh chain of free-list
    /// pages at the given pre-allocated `page_ids` (head-to-tail;
    /// length must equal [`Self::chain_page_count`]). Returns the
    /// built page buffers in the same order; the chain head is
    /// `page_ids[0]`.
    pub fn flush_to_disk(&self, page_size: u32, page_ids: &[u32]) -> Result<Vec<PageBuf>> {
        let ids = self.all_free();
        let per_page = entries_per_page(page_size).max(1);
        let chunks: Vec<&[u32]> = ids.chunks(per_page).collect();
        // `page_ids` may over-provide: the caller sizes it against the
        // free set *before* removing the ids that become chain-page
        // hosts, so the set being serialized here can be smaller than
        // that estimate. Never under-provide.
        debug_assert!(page_ids.len() >= chunks.len());
        let page_ids = &page_ids[..chunks.len()];

        let mut pages = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let id = page_ids[i];
            let mut buf = page::new_page(page_size, PageType::FreeList, id);
            let next = page_ids.get(i + 1).copied().unwrap_or(0);
            buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&next.to_le_bytes());
            buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4]
                .copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            let mut off = OFF_ENTRIES;
            for id in chunk.iter() {
                buf[off..off + 4].copy_from_slice(&id.to_le_bytes());
                off += 4;
            }
            page::set_page_crc(&mut buf);
            pages.push(buf);
        }
        Ok(pages)
    }

    /// Returns the ids of the chain pages themselves (not the free ids
    /// they list), for GC to mark reachable. Walks with the same cycle
    /// detection as [`Self::load_from_disk`].
    pub fn chain_page_ids<R>(head: u32, mut read_page_cb: R) -> Result<Vec<u32>>
    where
        R: FnMut(u32) -> Result<PageBuf>,
    {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut next = head;
        while next != 0 {
            if !seen.insert(next) {
                return Err(crate::error::Error::Corrupted(
                    "free-list chain cycle detected",
                ));
            }
            ids.push(next);
            let buf = read_page_cb(next)?;
            next = u32::from_le_bytes(buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap());
        }
        Ok(ids)
    }

    /// Repopulates the free set by walking the on-disk chain starting
    /// at `head` (0 means empty). `read_page_cb` fetches a page by id,
    /// verifying its CRC.
    pub fn load_from_disk<R>(&mut self, head: u32, mut read_page_cb: R) -> Result<()>
    where
        R: FnMut(u32) -> Result<PageBuf>,
    {
        self.free.clear();
        let mut seen = HashSet::new();
        let mut next = head;
        while next != 0 {
            if !seen.insert(next) {
                return Err(crate::error::Error::Corrupted(
                    "free-list chain cycle detected",
                ));
            }
            let buf = read_page_cb(next)?;
            let count = u32::from_le_bytes(
                buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4].try_into().unwrap(),
            ) as usize;
            let mut off = OFF_ENTRIES;
            for _ in 0..count {
                let id = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                self.free.insert(id);
                off += 4;
            }
            next = u32::from_le_bytes(buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap());
        }
        Ok(())
    }
}
