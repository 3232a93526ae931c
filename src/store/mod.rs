//! Blob store interface (spec.md §4.A).
//!
//! A blob store is a byte-addressable key-value store. Keys are opaque
//! short ASCII strings: content-hash hex for sealed blocks, descriptive
//! names for well-known pointers (e.g. `remote.root.base`).

pub mod disk;
pub mod http;
pub mod null;
pub mod paired;

use std::fmt;

/// Error returned by a blob store operation.
#[derive(Debug)]
pub enum StoreError {
    /// The key is not present.
    NotFound,
    /// Underlying I/O or transport failure.
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "not found"),
            StoreError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Flatten a `StoreError` into a plain `io::Error`, for call sites that
/// want to fold it into `Error::store_io` without caring about the
/// not-found/io distinction themselves.
pub fn as_io_error(e: StoreError) -> std::io::Error {
    match e {
        StoreError::NotFound => std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        StoreError::Io(io) => io,
    }
}

/// Byte-addressable key-value store.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Vec<u8>>;
    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Enumerate all keys. Only disk-backed stores are required to
    /// implement this usefully; others may return an empty list.
    fn list(&self) -> StoreResult<Vec<String>> {
        Ok(Vec::new())
    }
}
