//! Exclusive-open lock table (spec.md §4.H): a small fixed-size table
//! guarding `DMEXCL` opens, with a 5-minute expiry.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::pointer::Pointer;

const TABLE_SIZE: usize = 1024;
const LOCK_DURATION_SECS: u64 = 300;

#[derive(Clone, Copy)]
struct Entry {
    owner_fid: u64,
    node: Pointer,
    expires_at: u64,
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Guards exclusive opens of `DMEXCL` files. `node` identifies the locked
/// node by its current pointer — callers that lock an unsealed (pointer
/// still null) node use a stand-in identity; the ops layer is expected to
/// key locks by node id instead when that matters (see `LockTable::acquire_id`).
pub struct LockTable {
    entries: Mutex<Vec<Option<Entry>>>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable { entries: Mutex::new(vec![None; TABLE_SIZE]) }
    }

    fn acquire_key(&self, owner_fid: u64, key: Pointer) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let now = now();
        let mut free_slot = None;
        for (i, slot) in entries.iter().enumerate() {
            match slot {
                Some(e) if e.node == key && e.expires_at > now => return Err(Error::AlreadyLocked),
                Some(e) if e.expires_at <= now && free_slot.is_none() => free_slot = Some(i),
                None if free_slot.is_none() => free_slot = Some(i),
                _ => {}
            }
        }
        let slot = free_slot.ok_or(Error::OutOfLocks)?;
        entries[slot] = Some(Entry { owner_fid, node: key, expires_at: now + LOCK_DURATION_SECS });
        Ok(())
    }

    /// Acquire the exclusive-open lock identifying a node by `id` (the
    /// node's stable `u64` path identifier, stable across seal/flush
    /// re-keying, unlike its pointer).
    pub fn acquire(&self, owner_fid: u64, node_id: u64) -> Result<()> {
        self.acquire_key(owner_fid, Pointer::from_hash(id_key(node_id)))
    }

    pub fn release(&self, owner_fid: u64, node_id: u64) {
        let key = Pointer::from_hash(id_key(node_id));
        let mut entries = self.entries.lock().unwrap();
        for slot in entries.iter_mut() {
            if let Some(e) = slot {
                if e.owner_fid == owner_fid && e.node == key {
                    *slot = None;
                }
            }
        }
    }

    pub fn release_all_for_fid(&self, owner_fid: u64) {
        let mut entries = self.entries.lock().unwrap();
        for slot in entries.iter_mut() {
            if matches!(slot, Some(e) if e.owner_fid == owner_fid) {
                *slot = None;
            }
        }
    }
}

impl Default for LockTable {
    fn default() -> LockTable {
        LockTable::new()
    }
}

fn id_key(node_id: u64) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&node_id.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_node_fails() {
        let table = LockTable::new();
        table.acquire(1, 42).unwrap();
        assert!(matches!(table.acquire(2, 42), Err(Error::AlreadyLocked)));
    }

    #[test]
    fn release_frees_the_slot() {
        let table = LockTable::new();
        table.acquire(1, 42).unwrap();
        table.release(1, 42);
        table.acquire(2, 42).unwrap();
    }

    #[test]
    fn different_nodes_do_not_conflict() {
        let table = LockTable::new();
        table.acquire(1, 1).unwrap();
        table.acquire(2, 2).unwrap();
    }
}
