use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for extent, chain and stream operations.
///
/// Format and validation errors are raised while opening; a constructor that returns an error
/// never hands out a partially initialized disk. Errors from the underlying storage are carried
/// unchanged in [`DiskError::Io`].
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("malformed extent header: {0}")]
    MalformedHeader(&'static str),

    #[error("unsupported disk feature: {0}")]
    UnsupportedFeature(&'static str),

    /// The write is not allowed by the on-disk format or lies outside the fixed disk length.
    #[error("illegal write: {0}")]
    IllegalWrite(&'static str),

    /// The disk was opened without write access.
    #[error("disk was opened read-only")]
    ReadOnly,

    #[error("parent of {child} not found (tried {candidates:?})")]
    MissingParent {
        child: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("parent content id mismatch: child expects {expected:08x}, parent has {actual:08x}")]
    ParentMismatch { expected: u32, actual: u32 },

    #[error("corrupt grain indirection: {0}")]
    CorruptIndirection(&'static str),

    #[error("corrupt compressed grain: {0}")]
    CorruptGrain(&'static str),

    #[error("malformed descriptor (line {line}): {reason}")]
    MalformedDescriptor { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    /// A read was issued after end-of-stream had already been reported, or past the end.
    #[error("read past end of stream at position {position} (length {length})")]
    ReadPastEnd { position: u64, length: u64 },

    #[error("disk has been closed")]
    Closed,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DiskError> for std::io::Error {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::Io(e) => e,
            DiskError::ReadOnly => std::io::Error::new(std::io::ErrorKind::PermissionDenied, err),
            DiskError::NotSupported(_) => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, err)
            }
            DiskError::ReadPastEnd { .. } | DiskError::OutOfBounds { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            other => std::io::Error::other(other),
        }
    }
}
