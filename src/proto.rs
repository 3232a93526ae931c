//! Protocol-facing vocabulary: qids, directory-entry records, and the
//! glue that turns a `Node` into them (spec.md §4.I, §6). Message framing
//! and dispatch are out of scope (spec.md §1) — this module only carries
//! the types the ops layer hands back to that (external) dispatcher.

use crate::tree::{Node, DMAPPEND, DMDIR, DMEXCL};

pub const QTDIR: u8 = 0x80;
pub const QTAPPEND: u8 = 0x40;
pub const QTEXCL: u8 = 0x20;
pub const QTFILE: u8 = 0x00;

/// Unique, versioned identity of a node as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qid {
    pub qtype: u8,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn from_node(node: &Node) -> Qid {
        let mut qtype = QTFILE;
        if node.is_dir() {
            qtype |= QTDIR;
        }
        if node.is_append() {
            qtype |= QTAPPEND;
        }
        if node.is_excl() {
            qtype |= QTEXCL;
        }
        Qid { qtype, version: node.version, path: node.id }
    }
}

/// A directory-entry / stat record, carrying everything `stat`/`wstat`
/// and directory reads expose for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl DirEntry {
    pub fn from_node(node: &Node, uid: &str, gid: &str) -> DirEntry {
        DirEntry {
            qid: Qid::from_node(node),
            mode: node.mode,
            atime: node.modified,
            mtime: node.modified,
            length: if node.is_dir() { 0 } else { node.size },
            name: node.name.clone(),
            uid: uid.to_string(),
            gid: gid.to_string(),
            muid: uid.to_string(),
        }
    }
}

/// A patch to apply during `wstat`; `None` fields are left unchanged.
/// `length` is only honored for regular, non-append files (spec.md
/// §4.I); `atime` and `muid` have no persisted counterpart and are
/// accepted but silently dropped by the caller.
#[derive(Debug, Clone, Default)]
pub struct StatPatch {
    pub name: Option<String>,
    pub mode: Option<u32>,
    pub mtime: Option<u32>,
    pub length: Option<u64>,
    pub gid: Option<String>,
}

/// Mode bits create/wstat must accept unchanged: permission bits plus
/// the three behavioral bits this implementation supports.
pub const SUPPORTED_MODE_BITS: u32 = crate::tree::MODE_PERM_MASK | DMDIR | DMAPPEND | DMEXCL;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    #[test]
    fn qid_reflects_dir_and_excl_bits() {
        let mut node = Node::new_root("root".to_string());
        node.mode = DMDIR | DMEXCL | 0o755;
        let qid = Qid::from_node(&node);
        assert_eq!(qid.qtype, QTDIR | QTEXCL);
    }

    #[test]
    fn direntry_reports_zero_length_for_directories() {
        let mut node = Node::new_root("d".to_string());
        node.size = 999;
        let entry = DirEntry::from_node(&node, "u", "g");
        assert_eq!(entry.length, 0);
    }
}
