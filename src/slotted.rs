//! Generic slotted-page record store.
//!
//! Layout, starting at a caller-supplied `header_size` offset (32 for a
//! plain slotted page; 43 for a B+Tree page, which prepends its own
//! fixed-width header at offset 32 — see [`crate::btree::page`]):
//! `slot_count (u16) | free_space_end (u16) | slots[]`, where each slot
//! is `{ offset: u16, length: u16 }`. `offset == 0` marks a tombstoned
//! slot (offset 0 always falls inside the header, so it can never be a
//! real record's offset). Records grow downward from `free_space_end`;
//! the slot directory grows upward from `header_size + 4`.

use crate::error::{Error, Result};

const SLOT_ENTRY_SIZE: usize = 4;

fn slot_count_off(header_size: usize) -> usize {
    header_size
}

fn free_space_end_off(header_size: usize) -> usize {
    header_size + 2
}

fn slot_dir_off(header_size: usize) -> usize {
    header_size + 4
}

fn slot_off(header_size: usize, slot: u16) -> usize {
    slot_dir_off(header_size) + slot as usize * SLOT_ENTRY_SIZE
}

/// Initializes the slotted-page portion of `buf`: zero slots, free
/// space spanning everything after the slot directory header.
pub fn init(buf: &mut [u8], header_size: usize) {
    set_slot_count(buf, header_size, 0);
    set_free_space_end(buf, header_size, buf.len() as u16);
}

pub fn slot_count(buf: &[u8], header_size: usize) -> u16 {
    let off = slot_count_off(header_size);
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn set_slot_count(buf: &mut [u8], header_size: usize, n: u16) {
    let off = slot_count_off(header_size);
    buf[off..off + 2].copy_from_slice(&n.to_le_bytes());
}

pub fn free_space_end(buf: &[u8], header_size: usize) -> u16 {
    let off = free_space_end_off(header_size);
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn set_free_space_end(buf: &mut [u8], header_size: usize, end: u16) {
    let off = free_space_end_off(header_size);
    buf[off..off + 2].copy_from_slice(&end.to_le_bytes());
}

fn slot_entry(buf: &[u8], header_size: usize, slot: u16) -> (u16, u16) {
    let off = slot_off(header_size, slot);
    let offset = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
    let length = u16::from_le_bytes(buf[off + 2..off + 4].try_into().unwrap());
    (offset, length)
}

fn set_slot_entry(buf: &mut [u8], header_size: usize, slot: u16, offset: u16, length: u16) {
    let off = slot_off(header_size, slot);
    buf[off..off + 2].copy_from_slice(&offset.to_le_bytes());
    buf[off + 2..off + 4].copy_from_slice(&length.to_le_bytes());
}

/// Bytes available for a new record plus, if needed, a new slot entry.
pub fn free_space(buf: &[u8], header_size: usize) -> usize {
    let dir_end = slot_off(header_size, slot_count(buf, header_size));
    let data_start = free_space_end(buf, header_size) as usize;
    data_start.saturating_sub(dir_end)
}

fn find_tombstone(buf: &[u8], header_size: usize) -> Option<u16> {
    (0..slot_count(buf, header_size)).find(|&s| slot_entry(buf, header_size, s).0 == 0)
}

/// Inserts `bytes`, reusing a tombstoned slot if one exists, otherwise
/// appending a new slot. Returns the slot index.
pub fn insert_record(buf: &mut [u8], header_size: usize, bytes: &[u8]) -> Result<u16> {
    let len = bytes.len();
    if let Some(slot) = find_tombstone(buf, header_size) {
        let needed = len;
        let have = free_space(buf, header_size);
        if needed > have {
            return Err(Error::PageFull { needed, have });
        }
        let new_end = free_space_end(buf, header_size) as usize - len;
        buf[new_end..new_end + len].copy_from_slice(bytes);
        set_free_space_end(buf, header_size, new_end as u16);
        set_slot_entry(buf, header_size, slot, new_end as u16, len as u16);
        return Ok(slot);
    }

    let needed = len + SLOT_ENTRY_SIZE;
    let have = free_space(buf, header_size);
    if needed > have {
        return Err(Error::PageFull { needed, have });
    }
    let new_end = free_space_end(buf, header_size) as usize - len;
    buf[new_end..new_end + len].copy_from_slice(bytes);
    set_free_space_end(buf, header_size, new_end as u16);

    let slot = slot_count(buf, header_size);
    set_slot_entry(buf, header_size, slot, new_end as u16, len as u16);
    set_slot_count(buf, header_size, slot + 1);
    Ok(slot)
}

/// Returns the record at `slot`, or `None` if tombstoned.
pub fn get_record<'a>(buf: &'a [u8], header_size: usize, slot: u16) -> Result<Option<&'a [u8]>> {
    if slot >= slot_count(buf, header_size) {
        return Err(Error::OutOfRange { slot });
    }
    let (offset, length) = slot_entry(buf, header_size, slot);
    if offset == 0 {
        return Ok(None);
    }
    Ok(Some(&buf[offset as usize..offset as usize + length as usize]))
}

/// Rewrites `slot`'s record. Shrinking or same-size updates happen in
/// place (trailing bytes zero-filled); growing updates tombstone the
/// slot and append a fresh record under the same slot index.
pub fn update_record(buf: &mut [u8], header_size: usize, slot: u16, bytes: &[u8]) -> Result<()> {
    if slot >= slot_count(buf, header_size) {
        return Err(Error::OutOfRange { slot });
    }
    let (offset, old_len) = slot_entry(buf, header_size, slot);
    if offset != 0 && bytes.len() <= old_len as usize {
        let off = offset as usize;
        buf[off..off + bytes.len()].copy_from_slice(bytes);
        for b in &mut buf[off + bytes.len()..off + old_len as usize] {
            *b = 0;
        }
        set_slot_entry(buf, header_size, slot, offset, bytes.len() as u16);
        return Ok(());
    }

    let needed = bytes.len();
    let have = free_space(buf, header_size);
    if needed > have {
        return Err(Error::PageFull { needed, have });
    }
    let new_end = free_space_end(buf, header_size) as usize - bytes.len();
    buf[new_end..new_end + bytes.len()].copy_from_slice(bytes);
    set_free_space_end(buf, header_size, new_end as u16);
    set_slot_entry(buf, header_size, slot, new_end as u16, bytes.len() as u16);
    Ok(())
}

/// Tombstones `slot` (sets its offset to 0); the slot index remains
/// valid but `get_record` now returns `None` for it.
pub fn delete_record(buf: &mut [u8], header_size: usize, slot: u16) -> Result<()> {
    if slot >= slot_count(buf, header_size) {
        return Err(Error::OutOfRange { slot });
    }
    let (_, length) = slot_entry(buf, header_size, slot);
    set_slot_entry(buf, header_size, slot, 0, length);
    Ok(())
}

pub fn live_records(buf: &[u8], header_size: usize) -> u16 {
    (0..slot_count(buf, header_size))
        .filter(|&s| slot_entry(buf, header_size, s).0 != 0)
        .count() as u16
}

/// Rewrites all live records contiguously from the end of the page,
/// preserving slot indices (tombstoned slots stay tombstoned).
pub fn compact(buf: &mut [u8], header_size: usize) {
    let count = slot_count(buf, header_size);
    let mut entries: Vec<(u16, u16, u16)> = (0..count)
        .filter_map(|s| {
            let (offset, length) = slot_entry(buf, header_size, s);
            (offset != 0).then_some((s, offset, length))
        })
        .collect();
    // Compact in descending on-disk offset order so copies never overlap
    // a not-yet-relocated record.
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    let mut end = buf.len() as u16;
    for (slot, offset, length) in entries {
        let new_end = end - length;
        if new_end != offset {
            buf.copy_within(offset as usize..offset as usize + length as usize, new_end as usize);
        }
        set_slot_entry(buf, header_size, slot, new_end, length);
        end = new_end;
    }
    set_free_space_end(buf, header_size, end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{self, PageType};

    const H: usize = page::HEADER_SIZE;

    fn fresh() -> Box<[u8]> {
        let mut buf = page::new_page(256, PageType::FreeList, 1);
        init(&mut buf, H);
        buf
    }

    #[test]
    fn insert_and_get_round_trips() {
        let mut buf = fresh();
        let s1 = insert_record(&mut buf, H, b"hello").unwrap();
        let s2 = insert_record(&mut buf, H, b"world!").unwrap();
        assert_eq!(get_record(&buf, H, s1).unwrap(), Some(&b"hello"[..]));
        assert_eq!(get_record(&buf, H, s2).unwrap(), Some(&b"world!"[..]));
        assert_eq!(live_records(&buf, H), 2);
    }

    #[test]
    fn delete_then_reinsert_reuses_slot() {
        let mut buf = fresh();
        let s1 = insert_record(&mut buf, H, b"aaaa").unwrap();
        insert_record(&mut buf, H, b"bbbb").unwrap();
        delete_record(&mut buf, H, s1).unwrap();
        assert_eq!(get_record(&buf, H, s1).unwrap(), None);
        assert_eq!(live_records(&buf, H), 1);

        let s3 = insert_record(&mut buf, H, b"cc").unwrap();
        assert_eq!(s3, s1);
        assert_eq!(get_record(&buf, H, s3).unwrap(), Some(&b"cc"[..]));
    }

    #[test]
    fn update_shrink_in_place_grow_relocates() {
        let mut buf = fresh();
        let s = insert_record(&mut buf, H, b"0123456789").unwrap();
        update_record(&mut buf, H, s, b"short").unwrap();
        assert_eq!(get_record(&buf, H, s).unwrap(), Some(&b"short"[..]));

        update_record(&mut buf, H, s, b"a longer replacement value").unwrap();
        assert_eq!(
            get_record(&buf, H, s).unwrap(),
            Some(&b"a longer replacement value"[..])
        );
    }

    #[test]
    fn page_full_reports_needed_and_have() {
        let mut buf = fresh();
        let err = insert_record(&mut buf, H, &vec![0u8; 1000]).unwrap_err();
        match err {
            Error::PageFull { needed, .. } => assert_eq!(needed, 1004),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn compact_preserves_slot_indices_and_contents() {
        let mut buf = fresh();
        let s1 = insert_record(&mut buf, H, b"one").unwrap();
        let s2 = insert_record(&mut buf, H, b"two").unwrap();
        let s3 = insert_record(&mut buf, H, b"three").unwrap();
        delete_record(&mut buf, H, s2).unwrap();

        compact(&mut buf, H);

        assert_eq!(get_record(&buf, H, s1).unwrap(), Some(&b"one"[..]));
        assert_eq!(get_record(&buf, H, s2).unwrap(), None);
        assert_eq!(get_record(&buf, H, s3).unwrap(), Some(&b"three"[..]));
    }

    #[test]
    fn out_of_range_slot_errors() {
        let buf = fresh();
        assert!(matches!(
            get_record(&buf, H, 5),
            Err(Error::OutOfRange { slot: 5 })
        ));
    }
}
