//! Crash recovery: replay committed transactions from the WAL at open,
//! before any client work is accepted.

use crate::error::Result;
use crate::superblock::{self, Superblock};
use crate::wal::{RecordType, Wal};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::fs::FileExt;

/// Scans the WAL end-to-end (tolerating a torn/corrupt tail), applies
/// every committed transaction's page images whose LSN exceeds the
/// superblock's `checkpoint_lsn`, then advances and truncates the WAL.
/// Mutates `sb` and the data file in place; writes the superblock back
/// out if anything was applied.
pub fn recover(db_file: &File, wal: &Wal, sb: &mut Superblock) -> Result<()> {
    let records = wal.read_all_records()?;

    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    let mut images: HashMap<u64, Vec<(u64, u32, Vec<u8>)>> = HashMap::new();
    let mut max_seen_lsn = sb.checkpoint_lsn;
    let mut max_seen_tx = 0u64;

    for rec in &records {
        max_seen_lsn = max_seen_lsn.max(rec.lsn);
        max_seen_tx = max_seen_tx.max(rec.tx_id);
        match rec.record_type {
            RecordType::Commit => {
                committed.insert(rec.tx_id);
            }
            RecordType::Abort => {
                aborted.insert(rec.tx_id);
            }
            RecordType::PageImage => {
                images
                    .entry(rec.tx_id)
                    .or_default()
                    .push((rec.lsn, rec.page_id, rec.data.clone()));
            }
            RecordType::Begin | RecordType::Checkpoint => {}
        }
    }

    // Gather every applicable image across every committed transaction
    // into one timeline so that, when two committed transactions touch
    // the same page, the globally most recent LSN wins rather than
    // whichever transaction happened to be visited first.
    let mut timeline: Vec<(u64, u32, Vec<u8>)> = Vec::new();
    for (tx_id, pages) in images {
        if !committed.contains(&tx_id) || aborted.contains(&tx_id) {
            continue;
        }
        timeline.extend(pages.into_iter().filter(|(lsn, _, _)| *lsn > sb.checkpoint_lsn));
    }
    timeline.sort_by_key(|(lsn, _, _)| *lsn);

    let mut applied = false;
    let mut max_page_written = 0u32;
    for (_, page_id, data) in timeline {
        let offset = page_id as u64 * sb.page_size as u64;
        db_file.write_at(&data, offset)?;
        applied = true;
        max_page_written = max_page_written.max(page_id);
    }

    if applied {
        db_file.sync_all()?;
        sb.checkpoint_lsn = max_seen_lsn;
        sb.next_tx_id = sb.next_tx_id.max(max_seen_tx + 1);
        sb.next_page_id = sb.next_page_id.max(max_page_written + 1);
        sb.page_count = sb.page_count.max(sb.next_page_id);

        let buf = superblock::marshal(sb, sb.page_size);
        db_file.write_at(&buf, 0)?;
        db_file.sync_all()?;
    }

    // Whether or not anything was replayed, the WAL's next LSN must
    // never fall below the superblock's checkpoint LSN: a clean
    // checkpoint+close truncates the WAL to an empty record set while
    // `checkpoint_lsn` stays at whatever it reached, and a fresh WAL
    // starting back at LSN 1 would let the next `write_page` stamp
    // pages with LSNs `recover` itself would treat as already-applied
    // on a later crash. `max_seen_lsn` is seeded from `checkpoint_lsn`
    // above, so it already is that floor even when `records` is empty.
    wal.set_next_lsn(max_seen_lsn + 1);
    wal.truncate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page as btpage;
    use crate::page;
    use crate::wal::Wal;
    use tempfile::tempdir;

    fn fresh_db(page_size: u32) -> (std::fs::File, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let sb = Superblock::new(page_size);
        let buf = superblock::marshal(&sb, page_size);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.write_at(&buf, 0).unwrap();
        (file, dir)
    }

    #[test]
    fn applies_committed_transaction() {
        let page_size = 4096u32;
        let (db_file, dir) = fresh_db(page_size);
        let wal = Wal::open(dir.path().join("t.wal"), page_size).unwrap();

        let mut leaf = btpage::new_leaf(page_size, 1);
        btpage::rebuild_leaf(
            &mut leaf,
            &[btpage::LeafEntry {
                key: b"recovered".to_vec(),
                value: btpage::LeafValue::Inline(b"yes".to_vec()),
            }],
        )
        .unwrap();

        wal.append_record(RecordType::Begin, 1, 0, vec![]).unwrap();
        wal.append_page_image(1, 1, &mut leaf).unwrap();
        wal.append_record(RecordType::Commit, 1, 0, vec![]).unwrap();
        wal.sync().unwrap();

        let mut sb = Superblock::new(page_size);
        recover(&db_file, &wal, &mut sb).unwrap();

        let mut got = vec![0u8; page_size as usize];
        db_file.read_at(&mut got, page_size as u64).unwrap();
        page::verify_page_crc(&got).unwrap();
        let entries = btpage::leaf_entries(&got).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"recovered");
        assert_eq!(entries[0].value, btpage::LeafValue::Inline(b"yes".to_vec()));

        assert_eq!(wal.read_all_records().unwrap().len(), 0);
    }

    #[test]
    fn ignores_uncommitted_transaction() {
        let page_size = 4096u32;
        let (db_file, dir) = fresh_db(page_size);
        let wal = Wal::open(dir.path().join("t.wal"), page_size).unwrap();

        let mut leaf = btpage::new_leaf(page_size, 1);
        btpage::rebuild_leaf(
            &mut leaf,
            &[btpage::LeafEntry {
                key: b"uncommitted".to_vec(),
                value: btpage::LeafValue::Inline(b"no".to_vec()),
            }],
        )
        .unwrap();

        wal.append_record(RecordType::Begin, 99, 0, vec![]).unwrap();
        wal.append_page_image(99, 1, &mut leaf).unwrap();
        wal.sync().unwrap();

        let mut sb = Superblock::new(page_size);
        recover(&db_file, &wal, &mut sb).unwrap();

        // Page 1 was never applied: either the file never grew to
        // cover it, or (if it did) its contents are not the leaf we
        // tried to sneak in uncommitted.
        let mut got = vec![0u8; page_size as usize];
        if db_file.read_at(&mut got, page_size as u64).is_ok() {
            assert!(page::verify_page_crc(&got).is_err());
        }
    }
}
