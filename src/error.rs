//! Core error type.
//!
//! Every fallible operation in the tree, store and merge layers returns
//! this flat set of kinds. The filesystem operation layer (`fs`) maps them
//! onto protocol-visible error strings; nothing in the core ever panics on
//! a reachable error path.

use std::fmt;
use std::io;

/// A core-level error. Cloneable so tests can assert on it without holding
/// onto the original `io::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No such file, key, node or revision.
    NotExist,
    /// A sibling with that name already exists.
    Exist,
    /// Directory is not empty.
    NotEmpty,
    /// Operation not permitted (e.g. unlinking the root).
    PermissionDenied,
    /// An exclusive-open lock is already held on this node.
    AlreadyLocked,
    /// The exclusive-open lock table has no free slot.
    OutOfLocks,
    /// Malformed argument (bad path, bad mode bits, misaligned directory read).
    InvalidArgument,
    /// Attempted to mutate a read-only tree.
    ReadOnly,
    /// The target is in use and cannot be removed/moved right now.
    Busy,
    /// Expected a directory, found a regular file.
    NotDir,
    /// Expected a regular file, found a directory.
    IsDir,
    /// The codec does not recognize the encoding's version byte.
    CodecUnknownVersion(u8),
    /// Underlying blob store failed; message names the operation.
    StoreIO(String),
    /// A pointer reachable from the tree resolved to nothing in any store:
    /// the data existed once but was lost, as distinct from `NotExist`
    /// (the path itself was never there).
    DataLost(String),
    /// Operation was cancelled (e.g. grow aborted on first child-load error).
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotExist => write!(f, "no such file or directory"),
            Error::Exist => write!(f, "file exists"),
            Error::NotEmpty => write!(f, "directory not empty"),
            Error::PermissionDenied => write!(f, "operation not permitted"),
            Error::AlreadyLocked => write!(f, "file already locked"),
            Error::OutOfLocks => write!(f, "no free lock table entry"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::ReadOnly => write!(f, "tree is read-only"),
            Error::Busy => write!(f, "resource busy"),
            Error::NotDir => write!(f, "not a directory"),
            Error::IsDir => write!(f, "is a directory"),
            Error::CodecUnknownVersion(v) => write!(f, "unknown encoding version {v}"),
            Error::StoreIO(op) => write!(f, "store I/O error during {op}"),
            Error::DataLost(what) => write!(f, "data lost: {what}"),
            Error::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Wrap an `io::Error` observed while performing `op` against a blob store.
    pub fn store_io(op: &str, err: io::Error) -> Error {
        Error::StoreIO(format!("{op}: {err}"))
    }

    /// The protocol-visible error string this core error maps to (§7).
    pub fn proto_string(&self) -> &'static str {
        match self {
            Error::NotExist => "ENOENT",
            Error::Exist => "EEXIST",
            Error::NotEmpty => "ENOTEMPTY",
            Error::PermissionDenied => "EPERM",
            Error::AlreadyLocked => "file already locked",
            Error::OutOfLocks => "EBUSY",
            Error::InvalidArgument => "EINVAL",
            Error::ReadOnly => "EACCES",
            Error::Busy => "EBUSY",
            Error::NotDir => "ENOTDIR",
            Error::IsDir => "EISDIR",
            Error::CodecUnknownVersion(_) => "EINVAL",
            Error::StoreIO(_) => "EIO",
            Error::DataLost(_) => "ENODATA",
            Error::Cancelled => "EINTR",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
