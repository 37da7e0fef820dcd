//! Live engine statistics, assembled from [`crate::pager::Pager`] state
//! rather than persisted anywhere.

use crate::pager::Pager;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Stats {
    pub page_size: u32,
    pub page_count: u32,
    pub free_page_count: usize,
    pub checkpoint_lsn: u64,
    pub next_tx_id: u64,
    pub sync_count: u64,
    pub load_count: u64,
    pub db_path: PathBuf,
    pub wal_path: PathBuf,
}

pub fn collect(pager: &Pager) -> Stats {
    let s = pager.stats();
    Stats {
        page_size: s.page_size,
        page_count: s.page_count,
        free_page_count: s.free_page_count,
        checkpoint_lsn: s.checkpoint_lsn,
        next_tx_id: s.next_tx_id,
        sync_count: s.sync_count,
        load_count: s.load_count,
        db_path: pager.db_path().to_path_buf(),
        wal_path: pager.wal_path().to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    #[test]
    fn reflects_page_size_and_paths() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("t.db"))
            .with_page_size(4096)
            .unwrap();
        let pager = Pager::open(config).unwrap();
        let stats = collect(&pager);
        assert_eq!(stats.page_size, 4096);
        assert_eq!(stats.page_count, 1);
        assert_eq!(stats.db_path, dir.path().join("t.db"));
    }
}
