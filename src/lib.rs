//! musclefs: a content-addressed, encrypted filesystem core.
//!
//! A `Tree` ([`tree`]) is a mutable in-memory view onto a Merkle DAG of
//! [`Node`](tree::Node)s, persisted through a [`TreeStore`](treestore::TreeStore)
//! backed by staging/cache/remote [`BlobStore`](store::BlobStore)s wired
//! together by a [`BlockFactory`](block::BlockFactory) and a write-back
//! [`PairedStore`](store::paired::PairedStore). [`fs`] maps filesystem
//! requests onto tree operations; [`merge`] reconciles two revisions
//! against their common ancestor; [`history`] and [`snapshot`] provide
//! the read-only history view and the background snapshot/shutdown loop.

pub mod block;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod history;
pub mod locks;
pub mod merge;
pub mod pointer;
pub mod proto;
pub mod revision;
pub mod setup;
pub mod snapshot;
pub mod store;
pub mod tree;
pub mod treestore;

pub use error::{Error, Result};
pub use pointer::Pointer;
