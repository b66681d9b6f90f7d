//! Error types for blobcache operations
//!
//! All blobcache errors are represented by the BlobError enum, which carries
//! enough context (paths, offsets, reasons) to diagnose a failure without a
//! debugger attached.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Blobcache error types with detailed context
#[derive(Debug)]
pub enum BlobError {
    /// Key is invalid (empty, or longer than the on-disk format allows)
    BadKey {
        /// Description of what is wrong with the key
        reason: String,
    },

    /// Value cannot be encoded into the structured interchange format
    BadValue {
        /// Description of the unencodable part
        reason: String,
    },

    /// Key is absent or expired and no refresh callback was supplied
    NotFound {
        /// The key that was looked up
        key: String,
    },

    /// Operation invoked on a closed cache, including `close` twice
    Closed,

    /// Another process holds the advisory lock on the blob file
    Locked {
        /// Path to the locked blob file
        path: PathBuf,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Compression or structured encode/decode failed
    Codec {
        /// Description of the failure
        message: String,
    },

    /// Short read, malformed frame, or inconsistent length on disk
    Corrupt {
        /// File where corruption was detected
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::BadKey { reason } => {
                write!(f, "Invalid key: {}", reason)
            }

            BlobError::BadValue { reason } => {
                write!(f, "Invalid value: {}", reason)
            }

            BlobError::NotFound { key } => {
                write!(f, "Key `{}` is not found or expired", key)
            }

            BlobError::Closed => {
                write!(f, "Cache is closed")
            }

            BlobError::Locked { path } => {
                write!(f, "Blob file {} is locked by another process", path.display())
            }

            BlobError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            BlobError::Codec { message } => {
                write!(f, "Codec error: {}", message)
            }

            BlobError::Corrupt { path, offset, reason } => {
                write!(f, "Corrupt data in {} at offset {}: {}", path.display(), offset, reason)
            }
        }
    }
}

impl Error for BlobError {}

/// Convert std::io::Error to BlobError::Io
impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl BlobError {
    /// Build an Io error that names the file involved.
    pub(crate) fn io_at(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        BlobError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Result type alias for blobcache operations
pub type BlobResult<T> = Result<T, BlobError>;
