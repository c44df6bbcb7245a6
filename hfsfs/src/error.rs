use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read at byte offset {0}")]
    ShortRead(u64),

    #[error("no HFS, HFS+ or HFSX signature at offset 1024")]
    NotAFilesystem,

    #[error("invalid volume signature: 0x{0:04X}")]
    BadSignature(u16),

    #[error("primary and alternate volume headers are both unusable")]
    BothHeadersCorrupt,

    #[error("invalid volume header: {0}")]
    InvalidHeader(String),

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("invalid journal: {0}")]
    InvalidJournal(String),

    #[error("invalid volume name: {0}")]
    InvalidName(String),

    #[error("device too small: {0} bytes")]
    DeviceTooSmall(u64),

    #[error("write required but volume opened read-only: {0}")]
    ReadOnly(String),

    #[error("cancelled by operator")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, HfsError>;
