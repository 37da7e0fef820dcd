//! Linked chain of pages for values too large to fit inline in a leaf
//! record.
//!
//! Each page carries `next_overflow (u32) | data_len (u32) | payload`
//! right after the common 32-byte header, so a single page holds up to
//! `page_size - 40` bytes.

use crate::error::{Error, Result};
use crate::page::{self, PageBuf, PageType};

const OFF_NEXT: usize = page::HEADER_SIZE;
const OFF_DATA_LEN: usize = OFF_NEXT + 4;
const OFF_PAYLOAD: usize = OFF_DATA_LEN + 4;

/// Bytes of payload a single overflow page of `page_size` can carry.
pub fn capacity(page_size: u32) -> usize {
    page_size as usize - OFF_PAYLOAD
}

/// Initializes `buf` as an empty overflow page with no successor.
pub fn init(buf: &mut [u8], id: u32) {
    debug_assert_eq!(page::page_type(buf).unwrap(), PageType::Overflow);
    debug_assert_eq!(page::page_id(buf), id);
    set_next_overflow(buf, 0);
    set_data_len(buf, 0);
}

pub fn next_overflow(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[OFF_NEXT..OFF_NEXT + 4].try_into().unwrap())
}

pub fn set_next_overflow(buf: &mut [u8], next: u32) {
    buf[OFF_NEXT..OFF_NEXT + 4].copy_from_slice(&next.to_le_bytes());
}

fn data_len(buf: &[u8]) -> u32 {
    u32::from_le_bytes(buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].try_into().unwrap())
}

fn set_data_len(buf: &mut [u8], len: u32) {
    buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&len.to_le_bytes());
}

/// Sets this page's payload, failing if it exceeds one page's capacity.
pub fn set_data(buf: &mut [u8], bytes: &[u8]) -> Result<()> {
    let cap = capacity(buf.len() as u32);
    if bytes.len() > cap {
        return Err(Error::OverflowCapacity { len: bytes.len() });
    }
    buf[OFF_PAYLOAD..OFF_PAYLOAD + bytes.len()].copy_from_slice(bytes);
    for b in &mut buf[OFF_PAYLOAD + bytes.len()..] {
        *b = 0;
    }
    set_data_len(buf, bytes.len() as u32);
    Ok(())
}

pub fn data(buf: &[u8]) -> &[u8] {
    let len = data_len(buf) as usize;
    &buf[OFF_PAYLOAD..OFF_PAYLOAD + len]
}

/// Splits `bytes` into page-sized chunks, allocating each page via
/// `alloc`, chaining them head-to-tail, and returns the head page id.
/// `alloc` must return a freshly zeroed [`PageType::Overflow`] buffer
/// together with its id.
pub fn write_chain<A>(bytes: &[u8], page_size: u32, mut alloc: A) -> Result<(u32, Vec<PageBuf>)>
where
    A: FnMut() -> Result<(u32, PageBuf)>,
{
    let cap = capacity(page_size);
    let mut chunks: Vec<&[u8]> = bytes.chunks(cap.max(1)).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let mut pages = Vec::with_capacity(chunks.len());
    let mut ids = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let (id, mut buf) = alloc()?;
        init(&mut buf, id);
        set_data(&mut buf, chunk)?;
        ids.push(id);
        pages.push(buf);
    }
    for i in 0..pages.len() - 1 {
        set_next_overflow(&mut pages[i], ids[i + 1]);
    }
    for buf in &mut pages {
        page::set_page_crc(buf);
    }
    Ok((ids[0], pages))
}

/// Walks a chain starting at `head`, concatenating up to `total_size`
/// bytes. `read` fetches a page by id (and must verify its CRC).
/// Detects cycles via a seen-page-id set.
pub fn read_chain<R>(head: u32, total_size: usize, mut read: R) -> Result<Vec<u8>>
where
    R: FnMut(u32) -> Result<PageBuf>,
{
    let mut out = Vec::with_capacity(total_size);
    let mut seen = std::collections::HashSet::new();
    let mut next = head;
    while out.len() < total_size {
        if next == 0 || !seen.insert(next) {
            return Err(Error::Corrupted("overflow chain cycle or truncation"));
        }
        let buf = read(next)?;
        let remaining = total_size - out.len();
        let chunk = data(&buf);
        out.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
        next = next_overflow(&buf);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_round_trip() {
        let mut buf = page::new_page(256, PageType::Overflow, 3);
        init(&mut buf, 3);
        set_data(&mut buf, b"hello overflow").unwrap();
        assert_eq!(data(&buf), b"hello overflow");
        assert_eq!(next_overflow(&buf), 0);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut buf = page::new_page(64, PageType::Overflow, 1);
        init(&mut buf, 1);
        let err = set_data(&mut buf, &vec![0u8; 1000]).unwrap_err();
        assert!(matches!(err, Error::OverflowCapacity { .. }));
    }

    #[test]
    fn write_then_read_chain_round_trips() {
        let page_size = 64u32;
        let value: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut next_id = 10u32;
        let (head, pages) = write_chain(&value, page_size, || {
            let id = next_id;
            next_id += 1;
            Ok((id, page::new_page(page_size, PageType::Overflow, id)))
        })
        .unwrap();

        let by_id: std::collections::HashMap<u32, PageBuf> =
            pages.into_iter().map(|p| (page::page_id(&p), p)).collect();
        let got = read_chain(head, value.len(), |id| {
            by_id
                .get(&id)
                .cloned()
                .ok_or(Error::Corrupted("missing page"))
        })
        .unwrap();
        assert_eq!(got, value);
    }

    #[test]
    fn read_chain_detects_cycle() {
        let mut a = page::new_page(64, PageType::Overflow, 1);
        init(&mut a, 1);
        set_next_overflow(&mut a, 1);
        set_data(&mut a, b"x").unwrap();
        let err = read_chain(1, 100, |_| Ok(a.clone())).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }
}
