//! Append-only write-ahead log: a 32-byte file header followed by a
//! sequence of 33-byte-header records.
//!
//! Record header: `type (u8) | reserved (4) | lsn (u64) | tx_id (u64) |
//! page_id (u32) | data_len (u32) | crc32c (u32)`, CRC over header
//! (with the CRC field zeroed) plus payload. Payload is only present
//! for [`RecordType::PageImage`].

use crate::error::{Error, Result};
use crate::{FORMAT_VERSION, WAL_MAGIC};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

pub const FILE_HEADER_SIZE: usize = 32;
pub const RECORD_HEADER_SIZE: usize = 33;

const OFF_HDR_MAGIC: usize = 0;
const OFF_HDR_VERSION: usize = 8;
const OFF_HDR_PAGE_SIZE: usize = 12;
const OFF_HDR_CRC: usize = 16;

const OFF_REC_TYPE: usize = 0;
const OFF_REC_LSN: usize = 5;
const OFF_REC_TX_ID: usize = 13;
const OFF_REC_PAGE_ID: usize = 21;
const OFF_REC_DATA_LEN: usize = 25;
const OFF_REC_CRC: usize = 29;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Begin = 0,
    PageImage = 1,
    Commit = 2,
    Abort = 3,
    Checkpoint = 4,
}

impl RecordType {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RecordType::Begin),
            1 => Some(RecordType::PageImage),
            2 => Some(RecordType::Commit),
            3 => Some(RecordType::Abort),
            4 => Some(RecordType::Checkpoint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub record_type: RecordType,
    pub lsn: u64,
    pub tx_id: u64,
    pub page_id: u32,
    pub data: Vec<u8>,
}

fn crc32(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

fn encode_record(rec: &WalRecord) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_HEADER_SIZE + rec.data.len()];
    buf[OFF_REC_TYPE] = rec.record_type as u8;
    buf[OFF_REC_LSN..OFF_REC_LSN + 8].copy_from_slice(&rec.lsn.to_le_bytes());
    buf[OFF_REC_TX_ID..OFF_REC_TX_ID + 8].copy_from_slice(&rec.tx_id.to_le_bytes());
    buf[OFF_REC_PAGE_ID..OFF_REC_PAGE_ID + 4].copy_from_slice(&rec.page_id.to_le_bytes());
    buf[OFF_REC_DATA_LEN..OFF_REC_DATA_LEN + 4]
        .copy_from_slice(&(rec.data.len() as u32).to_le_bytes());
    buf[RECORD_HEADER_SIZE..].copy_from_slice(&rec.data);
    let crc = crc32(&buf);
    buf[OFF_REC_CRC..OFF_REC_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Parses one record out of `bytes` (header + payload). Returns `None`
/// on a short buffer, bad record type, or CRC mismatch — every such
/// case is treated identically by callers (stop scanning here).
fn decode_record(bytes: &[u8]) -> Option<WalRecord> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let record_type = RecordType::from_u8(bytes[OFF_REC_TYPE])?;
    let lsn = u64::from_le_bytes(bytes[OFF_REC_LSN..OFF_REC_LSN + 8].try_into().unwrap());
    let tx_id = u64::from_le_bytes(bytes[OFF_REC_TX_ID..OFF_REC_TX_ID + 8].try_into().unwrap());
    let page_id = u32::from_le_bytes(
        bytes[OFF_REC_PAGE_ID..OFF_REC_PAGE_ID + 4]
            .try_into()
            .unwrap(),
    );
    let data_len = u32::from_le_bytes(
        bytes[OFF_REC_DATA_LEN..OFF_REC_DATA_LEN + 4]
            .try_into()
            .unwrap(),
    ) as usize;
    if bytes.len() < RECORD_HEADER_SIZE + data_len {
        return None;
    }
    let stored_crc = u32::from_le_bytes(bytes[OFF_REC_CRC..OFF_REC_CRC + 4].try_into().unwrap());

    let mut check = bytes[..RECORD_HEADER_SIZE + data_len].to_vec();
    check[OFF_REC_CRC..OFF_REC_CRC + 4].copy_from_slice(&[0u8; 4]);
    if crc32(&check) != stored_crc {
        return None;
    }

    Some(WalRecord {
        record_type,
        lsn,
        tx_id,
        page_id,
        data: bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len].to_vec(),
    })
}

#[derive(Debug)]
struct WalState {
    file: File,
    offset: u64,
    next_lsn: u64,
}

/// The write-ahead log. Safe to share across threads: appends serialize
/// on a single internal mutex, matching the single-writer-offset
/// discipline the format requires.
#[derive(Debug)]
pub struct Wal {
    state: Mutex<WalState>,
    page_size: u32,
}

fn build_file_header(page_size: u32) -> [u8; FILE_HEADER_SIZE] {
    let mut hdr = [0u8; FILE_HEADER_SIZE];
    hdr[OFF_HDR_MAGIC..OFF_HDR_MAGIC + 8].copy_from_slice(&WAL_MAGIC);
    hdr[OFF_HDR_VERSION..OFF_HDR_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    hdr[OFF_HDR_PAGE_SIZE..OFF_HDR_PAGE_SIZE + 4].copy_from_slice(&page_size.to_le_bytes());
    let crc = crc32(&hdr[..OFF_HDR_CRC]);
    hdr[OFF_HDR_CRC..OFF_HDR_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    hdr
}

fn validate_file_header(hdr: &[u8], page_size: u32) -> Result<()> {
    if hdr.len() < FILE_HEADER_SIZE {
        return Err(Error::ShortRead);
    }
    if hdr[OFF_HDR_MAGIC..OFF_HDR_MAGIC + 8] != WAL_MAGIC {
        return Err(Error::WalBadMagic);
    }
    let version =
        u32::from_le_bytes(hdr[OFF_HDR_VERSION..OFF_HDR_VERSION + 4].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::WalUnsupportedVersion(version));
    }
    let wal_page_size = u32::from_le_bytes(
        hdr[OFF_HDR_PAGE_SIZE..OFF_HDR_PAGE_SIZE + 4]
            .try_into()
            .unwrap(),
    );
    if wal_page_size != page_size {
        return Err(Error::WalPageSizeMismatch {
            wal: wal_page_size,
            db: page_size,
        });
    }
    let stored_crc = u32::from_le_bytes(hdr[OFF_HDR_CRC..OFF_HDR_CRC + 4].try_into().unwrap());
    if crc32(&hdr[..OFF_HDR_CRC]) != stored_crc {
        return Err(Error::WalHeaderCrc);
    }
    Ok(())
}

impl Wal {
    /// Opens `path`, creating and writing a fresh file header if the
    /// file is new/empty, otherwise validating the existing header
    /// against `page_size`.
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();

        let offset = if len == 0 {
            let hdr = build_file_header(page_size);
            file.write_at(&hdr, 0)?;
            file.sync_all()?;
            FILE_HEADER_SIZE as u64
        } else {
            let mut hdr = [0u8; FILE_HEADER_SIZE];
            file.read_at(&mut hdr, 0)?;
            validate_file_header(&hdr, page_size)?;
            len
        };

        Ok(Wal {
            state: Mutex::new(WalState {
                file,
                offset,
                next_lsn: 1,
            }),
            page_size,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn next_lsn(&self) -> u64 {
        self.state.lock().unwrap().next_lsn
    }

    pub fn set_next_lsn(&self, lsn: u64) {
        self.state.lock().unwrap().next_lsn = lsn;
    }

    /// Appends a record (a freshly assigned monotonic LSN is stamped
    /// into it) and returns that LSN. Does not fsync.
    pub fn append_record(
        &self,
        record_type: RecordType,
        tx_id: u64,
        page_id: u32,
        data: Vec<u8>,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let lsn = state.next_lsn;
        let rec = WalRecord {
            record_type,
            lsn,
            tx_id,
            page_id,
            data,
        };
        let bytes = encode_record(&rec);
        state.file.write_at(&bytes, state.offset)?;
        state.offset += bytes.len() as u64;
        state.next_lsn += 1;
        Ok(lsn)
    }

    /// Stamps `buf`'s LSN and CRC with a freshly assigned LSN and
    /// appends it as a `PAGE_IMAGE` record, atomically with the LSN
    /// assignment (so the page on disk and the WAL record agree on
    /// which LSN they carry). Returns the assigned LSN.
    pub fn append_page_image(&self, tx_id: u64, page_id: u32, buf: &mut [u8]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let lsn = state.next_lsn;
        crate::page::set_lsn(buf, lsn);
        crate::page::set_page_crc(buf);
        let rec = WalRecord {
            record_type: RecordType::PageImage,
            lsn,
            tx_id,
            page_id,
            data: buf.to_vec(),
        };
        let bytes = encode_record(&rec);
        state.file.write_at(&bytes, state.offset)?;
        state.offset += bytes.len() as u64;
        state.next_lsn += 1;
        Ok(lsn)
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        state.file.sync_data()?;
        Ok(())
    }

    /// Truncates the log back to just the file header, for use after a
    /// successful checkpoint.
    pub fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.file.set_len(FILE_HEADER_SIZE as u64)?;
        state.file.sync_all()?;
        state.offset = FILE_HEADER_SIZE as u64;
        Ok(())
    }

    /// Reads every well-formed record from just after the file header
    /// to the first parse/CRC failure (a torn tail is tolerated and
    /// simply ends the scan).
    pub fn read_all_records(&self) -> Result<Vec<WalRecord>> {
        let state = self.state.lock().unwrap();
        let len = state.file.metadata()?.len();
        let mut buf = vec![0u8; (len - FILE_HEADER_SIZE as u64) as usize];
        state.file.read_at(&mut buf, FILE_HEADER_SIZE as u64)?;
        drop(state);

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            match decode_record(&buf[pos..]) {
                Some(rec) => {
                    pos += RECORD_HEADER_SIZE + rec.data.len();
                    records.push(rec);
                }
                None => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_after_write_preserves_records_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let page_size = 8192u32;
        let wal = Wal::open(&path, page_size).unwrap();

        let mut page = vec![0u8; page_size as usize];
        page[..15].copy_from_slice(b"page image data");

        let lsn1 = wal.append_record(RecordType::Begin, 1, 0, vec![]).unwrap();
        let lsn2 = wal
            .append_record(RecordType::PageImage, 1, 5, page.clone())
            .unwrap();
        let lsn3 = wal.append_record(RecordType::Commit, 1, 0, vec![]).unwrap();
        wal.sync().unwrap();

        let records = wal.read_all_records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record_type, RecordType::Begin);
        assert_eq!(records[0].lsn, lsn1);
        assert_eq!(records[1].record_type, RecordType::PageImage);
        assert_eq!(records[1].lsn, lsn2);
        assert_eq!(records[1].page_id, 5);
        assert_eq!(records[1].data, page);
        assert_eq!(records[2].record_type, RecordType::Commit);
        assert_eq!(records[2].lsn, lsn3);
    }

    #[test]
    fn reopen_validates_header_against_page_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        Wal::open(&path, 8192).unwrap();
        let err = Wal::open(&path, 4096).unwrap_err();
        assert!(matches!(err, Error::WalPageSizeMismatch { .. }));
    }

    #[test]
    fn ignores_trailing_partial_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path, 4096).unwrap();
        wal.append_record(RecordType::Begin, 1, 0, vec![]).unwrap();
        wal.sync().unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.write_at(&[1, 2, 3], len).unwrap();

        let records = wal.read_all_records().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn truncate_resets_to_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let wal = Wal::open(&path, 4096).unwrap();
        wal.append_record(RecordType::Begin, 1, 0, vec![]).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.read_all_records().unwrap().len(), 0);
    }
}
