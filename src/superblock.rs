//! Page 0: magic, version, page size, and the two tree roots the rest
//! of the engine bootstraps from.

use crate::error::{Error, Result};
use crate::page::{self, PageBuf, PageType};
use crate::{FILE_MAGIC, FORMAT_VERSION, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

const OFF_MAGIC: usize = page::HEADER_SIZE;
const OFF_VERSION: usize = OFF_MAGIC + 8;
const OFF_PAGE_SIZE: usize = OFF_VERSION + 4;
const OFF_PAGE_COUNT: usize = OFF_PAGE_SIZE + 4;
const OFF_FEATURE_FLAGS: usize = OFF_PAGE_COUNT + 4;
const OFF_CATALOG_ROOT: usize = OFF_FEATURE_FLAGS + 8;
const OFF_FREELIST_ROOT: usize = OFF_CATALOG_ROOT + 4;
const OFF_CHECKPOINT_LSN: usize = OFF_FREELIST_ROOT + 4;
const OFF_NEXT_TX_ID: usize = OFF_CHECKPOINT_LSN + 8;
const OFF_NEXT_PAGE_ID: usize = OFF_NEXT_TX_ID + 8;
#[cfg(test)]
const SUPERBLOCK_END: usize = OFF_NEXT_PAGE_ID + 4;

/// Feature bits with no defined semantics in this format revision.
/// Any bit set here must cause `open`/`unmarshal` to fail.
pub const SUPPORTED_FEATURES: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub page_size: u32,
    pub page_count: u32,
    pub feature_flags: u64,
    pub catalog_root: u32,
    pub freelist_root: u32,
    pub checkpoint_lsn: u64,
    pub next_tx_id: u64,
    pub next_page_id: u32,
}

impl Superblock {
    /// A fresh superblock for a brand-new database: one page allocated
    /// (the superblock itself), no catalog or free-list yet.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            page_count: 1,
            feature_flags: SUPPORTED_FEATURES,
            catalog_root: 0,
            freelist_root: 0,
            checkpoint_lsn: 0,
            next_tx_id: 1,
            next_page_id: 1,
        }
    }
}

/// Serializes `sb` into a fresh page-0 buffer of `page_size` bytes.
pub fn marshal(sb: &Superblock, page_size: u32) -> PageBuf {
    let mut buf = page::new_page(page_size, PageType::Superblock, 0);
    buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&FILE_MAGIC);
    buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&sb.page_size.to_le_bytes());
    buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].copy_from_slice(&sb.page_count.to_le_bytes());
    buf[OFF_FEATURE_FLAGS..OFF_FEATURE_FLAGS + 8].copy_from_slice(&sb.feature_flags.to_le_bytes());
    buf[OFF_CATALOG_ROOT..OFF_CATALOG_ROOT + 4].copy_from_slice(&sb.catalog_root.to_le_bytes());
    buf[OFF_FREELIST_ROOT..OFF_FREELIST_ROOT + 4]
        .copy_from_slice(&sb.freelist_root.to_le_bytes());
    buf[OFF_CHECKPOINT_LSN..OFF_CHECKPOINT_LSN + 8]
        .copy_from_slice(&sb.checkpoint_lsn.to_le_bytes());
    buf[OFF_NEXT_TX_ID..OFF_NEXT_TX_ID + 8].copy_from_slice(&sb.next_tx_id.to_le_bytes());
    buf[OFF_NEXT_PAGE_ID..OFF_NEXT_PAGE_ID + 4].copy_from_slice(&sb.next_page_id.to_le_bytes());
    page::set_page_crc(&mut buf);
    buf
}

/// Reads just the page-size field out of a page-0 buffer, without CRC
/// verification. Used to discover how many bytes to re-read for the
/// full, CRC-checked superblock when opening an existing database.
pub fn peek_page_size(buf: &[u8]) -> Result<u32> {
    if buf.len() < OFF_PAGE_SIZE + 4 {
        return Err(Error::ShortRead);
    }
    Ok(u32::from_le_bytes(
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap(),
    ))
}

/// Parses and validates page 0. Checks CRC, magic, version, page size,
/// and feature flags before returning the parsed struct.
pub fn unmarshal(buf: &[u8]) -> Result<Superblock> {
    page::verify_page_crc(buf)?;

    if buf[OFF_MAGIC..OFF_MAGIC + 8] != FILE_MAGIC {
        return Err(Error::BadMagic);
    }
    let version = u32::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let page_size = u32::from_le_bytes(buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].try_into().unwrap());
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::BadPageSize(page_size));
    }
    let feature_flags = u64::from_le_bytes(
        buf[OFF_FEATURE_FLAGS..OFF_FEATURE_FLAGS + 8]
            .try_into()
            .unwrap(),
    );
    if feature_flags & !SUPPORTED_FEATURES != 0 {
        return Err(Error::UnsupportedFeatures {
            flags: feature_flags,
        });
    }

    Ok(Superblock {
        page_size,
        page_count: u32::from_le_bytes(
            buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 4].try_into().unwrap(),
        ),
        feature_flags,
        catalog_root: u32::from_le_bytes(
            buf[OFF_CATALOG_ROOT..OFF_CATALOG_ROOT + 4]
                .try_into()
                .unwrap(),
        ),
        freelist_root: u32::from_le_bytes(
            buf[OFF_FREELIST_ROOT..OFF_FREELIST_ROOT + 4]
                .try_into()
                .unwrap(),
        ),
        checkpoint_lsn: u64::from_le_bytes(
            buf[OFF_CHECKPOINT_LSN..OFF_CHECKPOINT_LSN + 8]
                .try_into()
                .unwrap(),
        ),
        next_tx_id: u64::from_le_bytes(
            buf[OFF_NEXT_TX_ID..OFF_NEXT_TX_ID + 8].try_into().unwrap(),
        ),
        next_page_id: u32::from_le_bytes(
            buf[OFF_NEXT_PAGE_ID..OFF_NEXT_PAGE_ID + 4]
                .try_into()
                .unwrap(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            page_size: 8192,
            page_count: 50,
            feature_flags: 0,
            catalog_root: 5,
            freelist_root: 10,
            checkpoint_lsn: 999,
            next_tx_id: 42,
            next_page_id: 50,
        }
    }

    #[test]
    fn round_trips() {
        let sb = sample();
        let buf = marshal(&sb, sb.page_size);
        let back = unmarshal(&buf).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let sb = sample();
        let mut buf = marshal(&sb, sb.page_size);
        buf[OFF_MAGIC] ^= 0xFF;
        page::set_page_crc(&mut buf);
        assert!(matches!(unmarshal(&buf), Err(Error::BadMagic)));
    }

    #[test]
    fn rejects_crc_mismatch() {
        let sb = sample();
        let mut buf = marshal(&sb, sb.page_size);
        buf[SUPERBLOCK_END] ^= 0xFF;
        assert!(matches!(unmarshal(&buf), Err(Error::CrcMismatch { .. })));
    }

    #[test]
    fn rejects_unsupported_features() {
        let mut sb = sample();
        sb.feature_flags = 1;
        let buf = marshal(&sb, sb.page_size);
        assert!(matches!(
            unmarshal(&buf),
            Err(Error::UnsupportedFeatures { flags: 1 })
        ));
    }

    #[test]
    fn rejects_bad_page_size() {
        let mut sb = sample();
        sb.page_size = 3000;
        let buf = marshal(&sb, 8192);
        assert!(matches!(unmarshal(&buf), Err(Error::BadPageSize(3000))));
    }
}
