//! Encodes/decodes and persists nodes and revisions; manages local/remote
//! base pointers and the plaintext root key file (spec.md §4.E).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

use crate::block::BlockFactory;
use crate::codec::{self, NodeRecord, RevisionRecord, BASE_TAG};
use crate::crypto;
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::revision::Revision;
use crate::store::{as_io_error, BlobStore, StoreError};

const REMOTE_TAG_PREFIX: &str = "remote.root.";

pub struct TreeStore {
    base_dir: PathBuf,
    blocks: Arc<BlockFactory>,
    remote: Arc<dyn BlobStore>,
}

impl TreeStore {
    pub fn new(base_dir: PathBuf, blocks: Arc<BlockFactory>, remote: Arc<dyn BlobStore>) -> TreeStore {
        TreeStore { base_dir, blocks, remote }
    }

    fn persist_node(&self, record: &NodeRecord, propagate: bool) -> Result<Pointer> {
        let bytes = codec::encode_node(record)?;
        let (framed, pointer) = crypto::seal(self.blocks.key(), &bytes);
        let result = if propagate {
            self.blocks.paired().put(&pointer.store_key(), &framed)
        } else {
            self.blocks.cache().put(&pointer.store_key(), &framed)
        };
        result
            .map_err(|e| Error::store_io("store_node", as_io_error(e)))?;
        Ok(pointer)
    }

    /// Serialize, write a sealed metadata block locally, and return the
    /// new pointer. The node's own dirty flag is the caller's concern.
    pub fn store_node(&self, record: &NodeRecord) -> Result<Pointer> {
        self.persist_node(record, false)
    }

    /// Like `store_node`, but sets the sealed flag before encoding (so it
    /// is part of the hash) and propagates the ciphertext towards the
    /// remote store.
    pub fn seal_node(&self, record: &NodeRecord) -> Result<Pointer> {
        let mut sealed = record.clone();
        sealed.sealed = true;
        self.persist_node(&sealed, true)
    }

    /// Read and decode the node at `pointer`. A node salvaged with an
    /// empty name is given a fresh random name so it remains visible.
    pub fn load_node(&self, pointer: Pointer) -> Result<NodeRecord> {
        if pointer.is_null() {
            return Err(Error::NotExist);
        }
        let framed = self.blocks.paired().get(&pointer.store_key()).map_err(|e| match e {
            StoreError::NotFound => Error::DataLost(pointer.to_hex()),
            StoreError::Io(io) => Error::store_io("load_node", io),
        })?;
        let plaintext = crypto::unseal(self.blocks.key(), &framed)
            .ok_or_else(|| Error::DataLost(pointer.to_hex()))?;
        let mut record = codec::decode_node(&plaintext)?;
        if record.name.is_empty() {
            record.name = format!("salvaged-{}", random_suffix());
        }
        Ok(record)
    }

    pub fn store_revision(&self, revision: &Revision) -> Result<Pointer> {
        let record = revision.to_record();
        let bytes = codec::encode_revision(&record)?;
        let (framed, pointer) = crypto::seal(self.blocks.key(), &bytes);
        self.blocks
            .paired()
            .put(&pointer.store_key(), &framed)
            .map_err(|e| Error::store_io("store_revision", as_io_error(e)))?;
        Ok(pointer)
    }

    pub fn load_revision(&self, pointer: Pointer) -> Result<Revision> {
        if pointer.is_null() {
            return Err(Error::NotExist);
        }
        let framed = self.blocks.paired().get(&pointer.store_key()).map_err(|e| match e {
            StoreError::NotFound => Error::DataLost(pointer.to_hex()),
            StoreError::Io(io) => Error::store_io("load_revision", io),
        })?;
        let plaintext = crypto::unseal(self.blocks.key(), &framed)
            .ok_or_else(|| Error::DataLost(pointer.to_hex()))?;
        let record: RevisionRecord = codec::decode_revision(&plaintext)?;
        Ok(Revision::from_record(pointer, record))
    }

    // --- plaintext pointer files -----------------------------------------

    fn write_plaintext(path: &Path, contents: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents).map_err(|e| Error::store_io("write_plaintext", e))?;
        fs::rename(&tmp, path).map_err(|e| Error::store_io("write_plaintext", e))
    }

    fn root_path(&self) -> PathBuf {
        self.base_dir.join("root")
    }
    fn base_path(&self) -> PathBuf {
        self.base_dir.join("base")
    }
    fn base_history_path(&self) -> PathBuf {
        self.base_dir.join("base.history")
    }

    pub fn local_root_key(&self) -> Result<Pointer> {
        let contents = fs::read_to_string(self.root_path())
            .map_err(|e| Error::store_io("local_root_key", e))?;
        contents.trim().parse().map_err(|_| Error::InvalidArgument)
    }

    pub fn set_local_root_key(&self, pointer: Pointer) -> Result<()> {
        Self::write_plaintext(&self.root_path(), &pointer.to_hex())
    }

    pub fn local_base_pointer(&self) -> Result<Pointer> {
        let contents = fs::read_to_string(self.base_path())
            .map_err(|e| Error::store_io("local_base_pointer", e))?;
        contents.trim().parse().map_err(|_| Error::InvalidArgument)
    }

    pub fn set_local_base_pointer(&self, pointer: Pointer) -> Result<()> {
        let prev = self.local_base_pointer().unwrap_or(Pointer::NULL);
        Self::write_plaintext(&self.base_path(), &pointer.to_hex())?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let line = format!("{now}\t{}\n", prev.to_hex());
        let mut existing = fs::read_to_string(self.base_history_path()).unwrap_or_default();
        existing.push_str(&line);
        Self::write_plaintext(&self.base_history_path(), &existing)
    }

    // --- remote tags ------------------------------------------------------

    fn remote_tag_key(name: &str) -> String {
        format!("{REMOTE_TAG_PREFIX}{name}")
    }

    pub fn remote_tag(&self, name: &str) -> Result<Pointer> {
        let bytes = self.remote.get(&Self::remote_tag_key(name)).map_err(|e| match e {
            StoreError::NotFound => Error::NotExist,
            StoreError::Io(io) => Error::store_io("remote_tag", io),
        })?;
        let hex = String::from_utf8(bytes).map_err(|_| Error::InvalidArgument)?;
        hex.trim().parse().map_err(|_| Error::InvalidArgument)
    }

    pub fn set_remote_tags(&self, names: &[&str], pointer: Pointer) -> Result<()> {
        for name in names {
            self.remote
                .put(&Self::remote_tag_key(name), pointer.to_hex().as_bytes())
                .map_err(|e| Error::store_io("set_remote_tags", as_io_error(e)))?;
        }
        Ok(())
    }

    /// Yield up to `max` revisions following `tag_name`'s parent starting
    /// at `head`. Stops at a null parent or the first load error.
    pub fn history(&self, max: usize, head: Pointer, tag_name: &str) -> Vec<Revision> {
        let mut out = Vec::new();
        let mut cursor = head;
        while out.len() < max && !cursor.is_null() {
            match self.load_revision(cursor) {
                Ok(rev) => {
                    let next = rev
                        .parents
                        .iter()
                        .find(|(name, _)| name == tag_name)
                        .map(|(_, p)| *p)
                        .unwrap_or(Pointer::NULL);
                    out.push(rev);
                    cursor = next;
                }
                Err(_) => break,
            }
        }
        out
    }
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Canonical parent tag name (spec.md §3).
pub const CANONICAL_TAG: &str = BASE_TAG;
