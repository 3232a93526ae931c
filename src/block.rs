//! Fixed-capacity data blocks (spec.md §4.C).
//!
//! A block is *null* (no reference yet), *staging* (mutable, keyed by a
//! random identifier in the staging store) or *sealed* (immutable,
//! content-addressed, ciphertext held in the paired fast/slow store pair).
//! Every block operation is routed through a shared `BlockFactory` so that
//! individual `Block` values stay cheap (no store handles duplicated per
//! block in a large file).

use std::sync::Arc;

use log::warn;
use rand::RngCore;

use crate::crypto::{self, TreeKey};
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::store::paired::PairedStore;
use crate::store::{BlobStore, StoreError};

/// Default block capacity (spec.md §3): 1 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 1024 * 1024;

/// Opaque block reference, as described in spec.md §4.C.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRef {
    Staging(String),
    Sealed(Pointer),
}

impl BlockRef {
    /// Encode to bytes for the codec. Only sealed references can be
    /// encoded (spec.md §4.D: "unsealed children cannot be encoded").
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            BlockRef::Sealed(p) => Ok(p.as_bytes().to_vec()),
            BlockRef::Staging(_) => Err(Error::InvalidArgument),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<BlockRef> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidArgument)?;
        Ok(BlockRef::Sealed(Pointer::from_hash(arr)))
    }
}

/// Shared context every `Block` operation needs: the tree's block
/// capacity and symmetric key, the staging store (mutable, random keys),
/// the local cache (fast, content-addressed), and the paired store that
/// fronts the slow remote store.
pub struct BlockFactory {
    capacity: u32,
    key: TreeKey,
    staging: Arc<dyn BlobStore>,
    cache: Arc<dyn BlobStore>,
    paired: Arc<PairedStore>,
}

impl BlockFactory {
    pub fn new(
        capacity: u32,
        key: TreeKey,
        staging: Arc<dyn BlobStore>,
        cache: Arc<dyn BlobStore>,
        paired: Arc<PairedStore>,
    ) -> BlockFactory {
        BlockFactory { capacity, key, staging, cache, paired }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn new_block(&self) -> Block {
        Block { state: BlockState::Null, size: 0 }
    }

    pub fn key(&self) -> &TreeKey {
        &self.key
    }

    pub fn cache(&self) -> &Arc<dyn BlobStore> {
        &self.cache
    }

    pub fn paired(&self) -> &Arc<PairedStore> {
        &self.paired
    }

    fn random_staging_key(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Read a sealed block's plaintext, regardless of whether it still
    /// lives in the cache or has propagated to the slow store.
    fn read_sealed(&self, pointer: Pointer) -> Result<Vec<u8>> {
        let framed = self
            .paired
            .get(&pointer.store_key())
            .map_err(|e| match e {
                StoreError::NotFound => Error::DataLost(pointer.to_hex()),
                StoreError::Io(io) => Error::store_io("block read", io),
            })?;
        crypto::unseal(&self.key, &framed).ok_or(Error::DataLost(pointer.to_hex()))
    }
}

#[derive(Debug, Clone)]
enum BlockState {
    Null,
    Staging { key: String, plaintext: Vec<u8> },
    Sealed { pointer: Pointer },
}

/// A single fixed-capacity data block.
#[derive(Debug, Clone)]
pub struct Block {
    state: BlockState,
    size: u32,
}

impl Block {
    pub fn from_ref(reference: BlockRef, size: u32) -> Block {
        let state = match reference {
            BlockRef::Staging(key) => BlockState::Staging { key, plaintext: Vec::new() },
            BlockRef::Sealed(pointer) => BlockState::Sealed { pointer },
        };
        Block { state, size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn reference(&self) -> BlockRef {
        match &self.state {
            BlockState::Null => BlockRef::Staging(String::new()),
            BlockState::Staging { key, .. } => BlockRef::Staging(key.clone()),
            BlockState::Sealed { pointer } => BlockRef::Sealed(*pointer),
        }
    }

    fn plaintext(&self, factory: &BlockFactory) -> Result<Vec<u8>> {
        match &self.state {
            BlockState::Null => Ok(Vec::new()),
            BlockState::Staging { plaintext, .. } => Ok(plaintext.clone()),
            BlockState::Sealed { pointer } => factory.read_sealed(*pointer),
        }
    }

    /// Ensure the block is mutable, copying sealed plaintext into a fresh
    /// staging slot if necessary (copy-on-write).
    fn ensure_staging(&mut self, factory: &BlockFactory) -> Result<()> {
        match &self.state {
            BlockState::Staging { .. } => Ok(()),
            BlockState::Null => {
                self.state = BlockState::Staging { key: factory.random_staging_key(), plaintext: Vec::new() };
                Ok(())
            }
            BlockState::Sealed { pointer } => {
                let plaintext = factory.read_sealed(*pointer)?;
                self.state = BlockState::Staging { key: factory.random_staging_key(), plaintext };
                Ok(())
            }
        }
    }

    /// Write `bytes` at `offset`, clamped to the block's capacity. Returns
    /// bytes actually written and the signed change in logical size.
    pub fn write(&mut self, factory: &BlockFactory, bytes: &[u8], offset: u32) -> Result<(u32, i64)> {
        if offset > factory.capacity() {
            return Ok((0, 0));
        }
        self.ensure_staging(factory)?;
        let capacity = factory.capacity() as usize;
        let offset = offset as usize;
        let writable = capacity.saturating_sub(offset).min(bytes.len());
        let old_size = self.size;

        if let BlockState::Staging { plaintext, .. } = &mut self.state {
            if offset + writable > plaintext.len() {
                plaintext.resize(offset + writable, 0);
            }
            plaintext[offset..offset + writable].copy_from_slice(&bytes[..writable]);
            self.size = plaintext.len() as u32;
        }
        Ok((writable as u32, self.size as i64 - old_size as i64))
    }

    /// Read at most one block's worth of data starting at `offset`.
    pub fn read(&self, factory: &BlockFactory, buf: &mut [u8], offset: u32) -> Result<u32> {
        if offset >= self.size {
            return Ok(0);
        }
        let plaintext = self.plaintext(factory)?;
        let offset = offset as usize;
        let n = (plaintext.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&plaintext[offset..offset + n]);
        Ok(n as u32)
    }

    /// Set the logical size, zero-filling on growth. Fails if growing
    /// beyond capacity.
    pub fn truncate(&mut self, factory: &BlockFactory, new_size: u32) -> Result<()> {
        if new_size > factory.capacity() {
            return Err(Error::InvalidArgument);
        }
        self.ensure_staging(factory)?;
        if let BlockState::Staging { plaintext, .. } = &mut self.state {
            plaintext.resize(new_size as usize, 0);
        }
        self.size = new_size;
        Ok(())
    }

    /// Encrypt and content-address the block, writing via the paired
    /// store so the ciphertext also propagates to the slow store.
    /// Idempotent for already-sealed blocks.
    pub fn seal(&mut self, factory: &BlockFactory) -> Result<Pointer> {
        self.persist(factory, true)
    }

    /// Encrypt and content-address the block, writing only to the local
    /// cache (no propagation queued). For metadata blocks, whose key is
    /// already derived from content, this yields the same pointer `seal`
    /// would.
    pub fn flush(&mut self, factory: &BlockFactory) -> Result<Pointer> {
        self.persist(factory, false)
    }

    fn persist(&mut self, factory: &BlockFactory, propagate: bool) -> Result<Pointer> {
        if let BlockState::Sealed { pointer } = &self.state {
            return Ok(*pointer);
        }
        let plaintext = self.plaintext(factory)?;
        let (framed, pointer) = crypto::seal(&factory.key, &plaintext);
        let key = pointer.store_key();
        let result = if propagate {
            factory.paired.put(&key, &framed)
        } else {
            factory.cache.put(&key, &framed)
        };
        result.map_err(|e| Error::store_io("block seal", crate::store::as_io_error(e)))?;

        if let BlockState::Staging { key: staging_key, .. } = &self.state {
            if let Err(e) = factory.staging.delete(staging_key) {
                if !matches!(e, StoreError::NotFound) {
                    warn!("failed to discard staging key {staging_key}: {e}");
                }
            }
        }
        self.state = BlockState::Sealed { pointer };
        Ok(pointer)
    }

    /// Remove any staging key and drop in-memory bytes. Safe to call more
    /// than once.
    pub fn discard(&mut self, factory: &BlockFactory) {
        if let BlockState::Staging { key, .. } = &self.state {
            if let Err(e) = factory.staging.delete(key) {
                if !matches!(e, StoreError::NotFound) {
                    warn!("failed to discard staging key {key}: {e}");
                }
            }
        }
        self.state = BlockState::Null;
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::disk::DiskStore;
    use crate::store::null::NullStore;

    fn factory(tmp: &std::path::Path) -> BlockFactory {
        let staging = Arc::new(DiskStore::new(tmp.join("staging")).unwrap());
        let cache = Arc::new(DiskStore::new(tmp.join("cache")).unwrap());
        let slow = Arc::new(NullStore);
        let paired = Arc::new(
            PairedStore::new(cache.clone(), slow, &tmp.join("propagation.log")).unwrap(),
        );
        BlockFactory::new(64, TreeKey::from_bytes([3u8; 32]), staging, cache, paired)
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        let (n, delta) = block.write(&factory, b"hello", 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(delta, 5);
        let mut buf = [0u8; 5];
        let read = block.read(&factory, &mut buf, 0).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_beyond_capacity_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        let (n, _) = block.write(&factory, &[1u8; 100], 0).unwrap();
        assert_eq!(n, 64);
    }

    #[test]
    fn truncate_up_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        block.write(&factory, b"ab", 0).unwrap();
        block.truncate(&factory, 10).unwrap();
        let mut buf = [0xffu8; 10];
        block.read(&factory, &mut buf, 0).unwrap();
        assert_eq!(&buf[2..], &[0u8; 8]);
    }

    #[test]
    fn seal_then_write_copies_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        block.write(&factory, b"first", 0).unwrap();
        let p1 = block.seal(&factory).unwrap();
        assert!(matches!(block.reference(), BlockRef::Sealed(_)));

        block.write(&factory, b"second", 0).unwrap();
        assert!(matches!(block.reference(), BlockRef::Staging(_)));
        let p2 = block.seal(&factory).unwrap();
        assert_ne!(p1, p2);

        let mut buf = [0u8; 6];
        block.read(&factory, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn seal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        block.write(&factory, b"x", 0).unwrap();
        let p1 = block.seal(&factory).unwrap();
        let p2 = block.seal(&factory).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn discard_is_safe_twice() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path());
        let mut block = factory.new_block();
        block.write(&factory, b"x", 0).unwrap();
        block.discard(&factory);
        block.discard(&factory);
        assert_eq!(block.size(), 0);
    }
}
