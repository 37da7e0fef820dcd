//! Buffer pool, transactions, and checkpointing on top of one data
//! file and its WAL.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::freelist::FreeManager;
use crate::page::{self, PageBuf};
use crate::superblock::{self, Superblock};
use crate::wal::{RecordType, Wal};
use crate::MIN_PAGE_SIZE;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// A page identifier. Newtype over the on-disk `u32`; `0` denotes
/// "invalid/null" when used as a pointer, matching the wire format's
/// own convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u32);

impl PageId {
    pub const INVALID: PageId = PageId(0);

    pub fn new(id: u32) -> Self {
        PageId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Frame {
    bytes: PageBuf,
    dirty: bool,
}

#[derive(Default)]
struct TxEntry {
    dirty_pages: Vec<u32>,
    pending_frees: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct PagerStats {
    pub page_size: u32,
    pub page_count: u32,
    pub free_page_count: usize,
    pub checkpoint_lsn: u64,
    pub next_tx_id: u64,
    pub sync_count: u64,
    pub load_count: u64,
}

fn read_raw(db_file: &File, page_size: u32, id: u32) -> Result<PageBuf> {
    let mut buf = vec![0u8; page_size as usize].into_boxed_slice();
    db_file.read_at(&mut buf, id as u64 * page_size as u64)?;
    page::verify_page_crc(&buf)?;
    Ok(buf)
}

/// Owns the database file, the WAL, the buffer pool, and the
/// authoritative in-memory superblock. The unit of public access for
/// every other module in this crate.
pub struct Pager {
    db_file: File,
    wal: Wal,
    free: Mutex<FreeManager>,
    superblock: Mutex<Superblock>,
    cache: Mutex<HashMap<u32, Frame>>,
    txs: Mutex<HashMap<u64, TxEntry>>,
    next_tx_id: AtomicU64,
    closed: AtomicBool,
    page_size: u32,
    overflow_threshold: usize,
    db_path: PathBuf,
    wal_path: PathBuf,
    sync_count: AtomicU64,
    load_count: AtomicU64,
}

impl Pager {
    /// Opens (creating if absent) the database file and its WAL,
    /// validating or initializing the superblock, loading the
    /// free-list, and running recovery before returning.
    pub fn open(config: StorageConfig) -> Result<Self> {
        crate::config::validate_page_size(config.page_size)?;

        let db_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&config.db_path)?;
        let file_len = db_file.metadata()?.len();

        let mut sb = if file_len == 0 {
            let sb = Superblock::new(config.page_size);
            let buf = superblock::marshal(&sb, config.page_size);
            db_file.write_at(&buf, 0)?;
            db_file.sync_all()?;
            sb
        } else {
            let probe_len = (MIN_PAGE_SIZE as u64).min(file_len) as usize;
            let mut probe = vec![0u8; probe_len];
            db_file.read_at(&mut probe, 0)?;
            let page_size = superblock::peek_page_size(&probe)?;

            let mut full = vec![0u8; page_size as usize];
            db_file.read_at(&mut full, 0)?;
            superblock::unmarshal(&full)?
        };

        let page_size = sb.page_size;
        let overflow_threshold = config.overflow_threshold.min(page_size as usize / 4);

        let wal = Wal::open(&config.wal_path, page_size)?;
        crate::recovery::recover(&db_file, &wal, &mut sb)?;

        let mut free = FreeManager::new();
        free.load_from_disk(sb.freelist_root, |id| read_raw(&db_file, page_size, id))?;

        log::info!(
            "opened {:?}: page_size={} page_count={} free={} checkpoint_lsn={}",
            config.db_path,
            page_size,
            sb.page_count,
            free.count(),
            sb.checkpoint_lsn,
        );

        Ok(Pager {
            db_file,
            wal,
            next_tx_id: AtomicU64::new(sb.next_tx_id),
            free: Mutex::new(free),
            superblock: Mutex::new(sb),
            cache: Mutex::new(HashMap::new()),
            txs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            page_size,
            overflow_threshold,
            db_path: config.db_path,
            wal_path: config.wal_path,
            sync_count: AtomicU64::new(0),
            load_count: AtomicU64::new(0),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn overflow_threshold(&self) -> usize {
        self.overflow_threshold
    }

    pub fn catalog_root(&self) -> PageId {
        PageId(self.superblock.lock().unwrap().catalog_root)
    }

    pub fn set_catalog_root(&self, root: PageId) {
        self.superblock.lock().unwrap().catalog_root = root.0;
    }

    pub fn freelist_root(&self) -> PageId {
        PageId(self.superblock.lock().unwrap().freelist_root)
    }

    pub fn next_page_id(&self) -> u32 {
        self.superblock.lock().unwrap().next_page_id
    }

    pub fn is_free(&self, id: u32) -> bool {
        self.free.lock().unwrap().contains(id)
    }

    /// Adds `id` straight to the free set, bypassing the transaction
    /// log. Used only by GC, which runs with exclusive access and
    /// forces a checkpoint itself once done.
    pub fn mark_free_direct(&self, id: u32) {
        self.free.lock().unwrap().free(id);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn begin_tx(&self) -> Result<u64> {
        self.check_open()?;
        let tx = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.wal.append_record(RecordType::Begin, tx, 0, vec![])?;
        self.txs.lock().unwrap().insert(tx, TxEntry::default());
        log::trace!("tx {tx} begin");
        Ok(tx)
    }

    fn tx_entry_mut<'a>(
        txs: &'a mut HashMap<u64, TxEntry>,
        tx: u64,
    ) -> Result<&'a mut TxEntry> {
        txs.get_mut(&tx).ok_or(Error::UnknownTx(tx))
    }

    pub fn commit_tx(&self, tx: u64) -> Result<()> {
        self.check_open()?;
        let entry = self
            .txs
            .lock()
            .unwrap()
            .remove(&tx)
            .ok_or(Error::UnknownTx(tx))?;
        {
            let mut free = self.free.lock().unwrap();
            for id in &entry.pending_frees {
                free.free(*id);
            }
        }
        self.wal.append_record(RecordType::Commit, tx, 0, vec![])?;
        self.wal.sync()?;
        log::debug!(
            "tx {tx} commit: {} pages written, {} freed",
            entry.dirty_pages.len(),
            entry.pending_frees.len()
        );
        Ok(())
    }

    pub fn abort_tx(&self, tx: u64) -> Result<()> {
        self.check_open()?;
        let entry = self
            .txs
            .lock()
            .unwrap()
            .remove(&tx)
            .ok_or(Error::UnknownTx(tx))?;
        self.wal.append_record(RecordType::Abort, tx, 0, vec![])?;
        let mut cache = self.cache.lock().unwrap();
        for id in &entry.dirty_pages {
            cache.remove(id);
        }
        log::warn!(
            "tx {tx} abort: discarded {} dirty pages",
            entry.dirty_pages.len()
        );
        Ok(())
    }

    /// Allocates a page id for transaction `tx`: prefers the free set,
    /// otherwise extends the high-water mark. Does not write anything;
    /// the caller must follow up with [`Self::write_page`].
    pub fn alloc_page(&self, tx: u64) -> Result<PageId> {
        self.check_open()?;
        {
            let txs = self.txs.lock().unwrap();
            if !txs.contains_key(&tx) {
                return Err(Error::UnknownTx(tx));
            }
        }
        if let Some(id) = self.free.lock().unwrap().alloc() {
            return Ok(PageId(id));
        }
        let mut sb = self.superblock.lock().unwrap();
        let id = sb.next_page_id;
        sb.next_page_id += 1;
        sb.page_count = sb.page_count.max(sb.next_page_id);
        Ok(PageId(id))
    }

    /// Fetches a page from the cache, or reads and CRC-verifies it
    /// from disk on a miss.
    pub fn read_page(&self, id: PageId) -> Result<PageBuf> {
        self.check_open()?;
        {
            let cache = self.cache.lock().unwrap();
            if let Some(frame) = cache.get(&id.0) {
                return Ok(frame.bytes.clone());
            }
        }
        let buf = read_raw(&self.db_file, self.page_size, id.0)?;
        self.load_count.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock().unwrap();
        let frame = cache.entry(id.0).or_insert_with(|| Frame {
            bytes: buf.clone(),
            dirty: false,
        });
        Ok(frame.bytes.clone())
    }

    /// Reads a page's raw bytes without CRC verification, for
    /// diagnostics that need to inspect a corrupt page rather than
    /// fail on it.
    pub fn read_page_unchecked(&self, id: PageId) -> Result<PageBuf> {
        self.check_open()?;
        if let Some(frame) = self.cache.lock().unwrap().get(&id.0) {
            return Ok(frame.bytes.clone());
        }
        let mut buf = vec![0u8; self.page_size as usize].into_boxed_slice();
        self.db_file
            .read_at(&mut buf, id.0 as u64 * self.page_size as u64)?;
        Ok(buf)
    }

    /// Stamps `buf` with the next WAL LSN, recomputes its CRC, appends
    /// a `PAGE_IMAGE` record, and marks the page dirty under `tx` in
    /// the buffer pool.
    pub fn write_page(&self, tx: u64, id: PageId, mut buf: PageBuf) -> Result<()> {
        self.check_open()?;
        self.wal.append_page_image(tx, id.0, &mut buf)?;
        self.cache.lock().unwrap().insert(
            id.0,
            Frame {
                bytes: buf,
                dirty: true,
            },
        );
        let mut txs = self.txs.lock().unwrap();
        Self::tx_entry_mut(&mut txs, tx)?.dirty_pages.push(id.0);
        Ok(())
    }

    /// Marks `id` for reclamation once `tx` commits. Aborting `tx`
    /// discards the pending free instead.
    pub fn free_page(&self, tx: u64, id: PageId) -> Result<()> {
        self.check_open()?;
        let mut txs = self.txs.lock().unwrap();
        Self::tx_entry_mut(&mut txs, tx)?.pending_frees.push(id.0);
        Ok(())
    }

    /// Flushes dirty pages, rebuilds and writes the free-list chain,
    /// updates and writes the superblock, then truncates the WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_open()?;

        let dirty: Vec<(u32, PageBuf)> = {
            let mut cache = self.cache.lock().unwrap();
            cache
                .iter_mut()
                .filter(|(_, f)| f.dirty)
                .map(|(id, f)| {
                    f.dirty = false;
                    (*id, f.bytes.clone())
                })
                .collect()
        };
        for (id, buf) in &dirty {
            self.db_file
                .write_at(buf, *id as u64 * self.page_size as u64)?;
        }
        if !dirty.is_empty() {
            self.db_file.sync_all()?;
        }

        let (freelist_root, free_count) = self.rebuild_freelist()?;

        let mut sb = self.superblock.lock().unwrap();
        sb.checkpoint_lsn = self.wal.next_lsn().saturating_sub(1);
        sb.next_tx_id = self.next_tx_id.load(Ordering::SeqCst);
        sb.freelist_root = freelist_root;
        let buf = superblock::marshal(&sb, self.page_size);
        self.db_file.write_at(&buf, 0)?;
        self.db_file.sync_all()?;
        drop(sb);

        self.wal.truncate()?;
        self.sync_count.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "checkpoint: {} pages flushed, {free_count} free pages persisted",
            dirty.len()
        );
        Ok(())
    }

    /// Allocates chain pages for the current free set and writes them
    /// out, returning the new head. Hosts are always fresh page ids
    /// (extending the file) rather than reused free ids: reusing a
    /// free id as its own list's host would remove it from the set it
    /// is meant to describe.
    fn rebuild_freelist(&self) -> Result<(u32, usize)> {
        let free = self.free.lock().unwrap();
        let n = free.chain_page_count(self.page_size);
        if n == 0 {
            return Ok((0, 0));
        }

        let mut chain_ids = Vec::with_capacity(n);
        {
            let mut sb = self.superblock.lock().unwrap();
            for _ in 0..n {
                let id = sb.next_page_id;
                sb.next_page_id += 1;
                sb.page_count = sb.page_count.max(sb.next_page_id);
                chain_ids.push(id);
            }
        }

        let pages = free.flush_to_disk(self.page_size, &chain_ids)?;
        let free_count = free.count();
        for buf in &pages {
            let id = page::page_id(buf);
            self.db_file
                .write_at(buf, id as u64 * self.page_size as u64)?;
        }
        self.db_file.sync_all()?;
        let head = pages.first().map(|buf| page::page_id(buf)).unwrap_or(0);
        Ok((head, free_count))
    }

    pub fn stats(&self) -> PagerStats {
        let sb = self.superblock.lock().unwrap();
        PagerStats {
            page_size: self.page_size,
            page_count: sb.page_count,
            free_page_count: self.free.lock().unwrap().count(),
            checkpoint_lsn: sb.checkpoint_lsn,
            next_tx_id: self.next_tx_id.load(Ordering::SeqCst),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            load_count: self.load_count.load(Ordering::Relaxed),
        }
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    pub fn wal_path(&self) -> &std::path::Path {
        &self.wal_path
    }

    /// Forces a final checkpoint and marks the pager closed; further
    /// operations fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        self.checkpoint()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pager(dir: &tempfile::TempDir) -> Pager {
        let config = StorageConfig::new(dir.path().join("t.db")).with_page_size(4096).unwrap();
        Pager::open(config).unwrap()
    }

    #[test]
    fn commit_then_reopen_survives_crash_before_checkpoint() {
        let dir = tempdir().unwrap();
        {
            let pager = open_pager(&dir);
            let tx = pager.begin_tx().unwrap();
            let id = pager.alloc_page(tx).unwrap();
            let mut buf = crate::btree::page::new_leaf(pager.page_size(), id.as_u32());
            crate::btree::page::rebuild_leaf(
                &mut buf,
                &[crate::btree::page::LeafEntry {
                    key: b"k".to_vec(),
                    value: crate::btree::page::LeafValue::Inline(b"v".to_vec()),
                }],
            )
            .unwrap();
            pager.write_page(tx, id, buf).unwrap();
            pager.commit_tx(tx).unwrap();
            // No checkpoint: simulate a crash by just dropping here.
        }

        let config = StorageConfig::new(dir.path().join("t.db")).with_page_size(4096).unwrap();
        let pager2 = Pager::open(config).unwrap();
        let buf = pager2.read_page(PageId::new(1)).unwrap();
        let entries = crate::btree::page::leaf_entries(&buf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"k");
    }

    #[test]
    fn abort_discards_dirty_page_from_cache() {
        let dir = tempdir().unwrap();
        let pager = open_pager(&dir);
        let tx = pager.begin_tx().unwrap();
        let id = pager.alloc_page(tx).unwrap();
        let buf = crate::btree::page::new_leaf(pager.page_size(), id.as_u32());
        pager.write_page(tx, id, buf).unwrap();
        pager.abort_tx(tx).unwrap();

        let err = pager.read_page(id).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { .. }) || matches!(err, Error::Io(_)));
    }

    #[test]
    fn checkpoint_persists_freelist_across_reopen() {
        let dir = tempdir().unwrap();
        let freed_id;
        {
            let pager = open_pager(&dir);
            let tx = pager.begin_tx().unwrap();
            let id = pager.alloc_page(tx).unwrap();
            let buf = crate::btree::page::new_leaf(pager.page_size(), id.as_u32());
            pager.write_page(tx, id, buf).unwrap();
            pager.free_page(tx, id).unwrap();
            pager.commit_tx(tx).unwrap();
            pager.checkpoint().unwrap();
            freed_id = id;
        }

        let config = StorageConfig::new(dir.path().join("t.db")).with_page_size(4096).unwrap();
        let pager2 = Pager::open(config).unwrap();
        assert_eq!(pager2.stats().free_page_count, 1);
        let tx = pager2.begin_tx().unwrap();
        assert_eq!(pager2.alloc_page(tx).unwrap(), freed_id);
    }
}
