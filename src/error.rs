//! Engine error taxonomy.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// The volume geometry cannot describe a FAT32 file system, or a
    /// formatter parameter is unusable.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The FAT has fewer free clusters than requested.
    #[error("free clusters exhausted: couldn't allocate {requested}, only {free} left")]
    OutOfSpace { requested: u32, free: u32 },

    /// No free slot group of the required size and the table is at its
    /// 2 MiB cap.
    #[error("directory table of '{0}' has reached its maximum extension")]
    DirectoryFull(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("directory '{0}' is not empty")]
    NotEmpty(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A FAT entry out of range, a broken on-disk signature, or a chain
    /// longer than the volume (implicit cycle detection).
    #[error("corrupt volume state: {0}")]
    CorruptState(String),
}
