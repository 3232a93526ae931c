//! In-memory node representation (spec.md §3).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::Block;
use crate::pointer::Pointer;

use super::arena::NodeIndex;

pub const MODE_PERM_MASK: u32 = 0o777;
pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;

/// Mode bits the wire protocol does not support; create/wstat reject them.
pub const UNSUPPORTED_MODE_BITS: u32 = 0x0010_0000 // DMMOUNT
    | 0x0008_0000 // DMAUTH
    | 0x0004_0000 // DMTMP
    | 0x0200_0000 // DMSYMLINK (also shares bits with DMREGULAR on some platforms; kept distinct here)
    | 0x0100_0000 // DMDEVICE
    | 0x0002_0000 // DMNAMEDPIPE
    | 0x0001_0000 // DMSOCKET
    | 0x0080_0000 // DMSETUID
    | 0x0040_0000 // DMSETGID
    | 0x0020_0000; // DMLINK

pub fn now_secs() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

pub fn now_secs_i64() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// A child known only by its sealed metadata pointer; not yet loaded
    /// into the arena. Its name is unknown until `grow` loads it.
    Unloaded(Pointer),
    Loaded(NodeIndex),
}

#[derive(Debug, Clone, Copy)]
pub struct ChildEntry {
    pub state: ChildState,
}

/// An inode-equivalent, resident in the tree's arena.
#[derive(Debug)]
pub struct Node {
    pub id: u64,
    pub version: u32,
    pub name: String,
    pub mode: u32,
    pub modified: u32,
    pub size: u64,
    pub block_size: u32,
    pub children: Vec<ChildEntry>,
    pub blocks: Vec<Block>,
    pub parent: Option<NodeIndex>,
    pub loaded: bool,
    pub dirty: bool,
    pub sealed: bool,
    pub unlinked: bool,
    pub refcount: u32,
    /// The pointer this node was last stored/sealed under, or
    /// `Pointer::NULL` if it has never been persisted.
    pub pointer: Pointer,
}

impl Node {
    pub fn new_root(name: String) -> Node {
        let now = now_secs();
        Node {
            id: now_ns(),
            version: 1,
            name,
            mode: 0o700 | DMDIR,
            modified: now,
            size: 0,
            block_size: crate::block::DEFAULT_BLOCK_SIZE,
            children: Vec::new(),
            blocks: Vec::new(),
            parent: None,
            loaded: true,
            dirty: true,
            sealed: false,
            unlinked: false,
            refcount: 0,
            pointer: Pointer::NULL,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }

    pub fn is_append(&self) -> bool {
        self.mode & DMAPPEND != 0
    }

    pub fn is_excl(&self) -> bool {
        self.mode & DMEXCL != 0
    }

    pub fn perm_bits(&self) -> u32 {
        self.mode & MODE_PERM_MASK
    }
}
