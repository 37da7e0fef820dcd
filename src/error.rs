use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad superblock magic")]
    BadMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported page size: {0}")]
    BadPageSize(u32),

    #[error("unsupported feature flags: {flags:#x}")]
    UnsupportedFeatures { flags: u64 },

    #[error("crc mismatch on page {page_id}")]
    CrcMismatch { page_id: u32 },

    #[error("wal crc mismatch at lsn {lsn}")]
    WalCrcMismatch { lsn: u64 },

    #[error("wal bad magic")]
    WalBadMagic,

    #[error("wal unsupported version: {0}")]
    WalUnsupportedVersion(u32),

    #[error("wal page size mismatch: wal={wal}, db={db}")]
    WalPageSizeMismatch { wal: u32, db: u32 },

    #[error("wal header crc mismatch")]
    WalHeaderCrc,

    #[error("wal short read")]
    ShortRead,

    #[error("page full: needed {needed} bytes, have {have}")]
    PageFull { needed: usize, have: usize },

    #[error("slot {slot} out of range")]
    OutOfRange { slot: u16 },

    #[error("overflow value exceeds chain capacity: {len} bytes")]
    OverflowCapacity { len: usize },

    #[error("table not found: {tenant}/{table}")]
    NotFound { tenant: String, table: String },

    #[error("unknown transaction {0}")]
    UnknownTx(u64),

    #[error("storage engine is closed")]
    Closed,

    #[error("storage corrupted: {0}")]
    Corrupted(&'static str),
}
