//! Fid table (spec.md §4.I `[FULL]`): fids are handed to the core by an
//! external dispatcher, never allocated here.

use std::collections::HashMap;

use crate::tree::NodeIndex;

pub type Fid = u64;

/// What a fid currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aux {
    Control,
    SyntheticRoot,
    Node(NodeIndex),
}

#[derive(Debug)]
pub struct FidState {
    pub aux: Aux,
    pub open: bool,
    /// Prepared at `open` time for directories and the two synthetic
    /// directories; consumed by sequential reads.
    pub dir_buffer: Option<Vec<u8>>,
}

impl FidState {
    pub fn new(aux: Aux) -> FidState {
        FidState { aux, open: false, dir_buffer: None }
    }
}

/// All fids currently known to the server, guarded by the same tree
/// mutex the rest of the ops layer uses (no separate lock, per §5).
#[derive(Default)]
pub struct FidTable {
    fids: HashMap<Fid, FidState>,
}

impl FidTable {
    pub fn new() -> FidTable {
        FidTable { fids: HashMap::new() }
    }

    pub fn insert(&mut self, fid: Fid, state: FidState) {
        self.fids.insert(fid, state);
    }

    pub fn get(&self, fid: Fid) -> Option<&FidState> {
        self.fids.get(&fid)
    }

    pub fn get_mut(&mut self, fid: Fid) -> Option<&mut FidState> {
        self.fids.get_mut(&fid)
    }

    pub fn remove(&mut self, fid: Fid) -> Option<FidState> {
        self.fids.remove(&fid)
    }
}
