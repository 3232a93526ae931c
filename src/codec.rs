//! Versioned binary encoding of nodes and revisions (spec.md §4.D).
//!
//! All integers are little-endian; strings are length-prefixed `u16`.
//! A leading version byte selects the decoder. Version 16 is emitted on
//! every write. Version 15 revisions (a single unnamed parent pointer)
//! are read and mapped onto a revision whose sole parent tag is `base`,
//! for forward compatibility with older stores.

use crate::block::BlockRef;
use crate::error::{Error, Result};
use crate::pointer::Pointer;

pub const NODE_VERSION: u8 = 16;
pub const REVISION_VERSION: u8 = 16;
const REVISION_VERSION_LEGACY_SINGLE_PARENT: u8 = 15;

pub const BASE_TAG: &str = "base";

/// Flat, store-agnostic view of a node's persisted fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: u64,
    pub version: u32,
    pub name: String,
    pub sealed: bool,
    pub unlinked: bool,
    pub block_size: u32,
    pub mode: u32,
    pub size: u64,
    pub modified: u32,
    pub children: Vec<BlockRef>,
    pub blocks: Vec<BlockRef>,
}

/// Flat view of a revision's persisted fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub root: Pointer,
    /// Ordered named parent tags; the tag named `base` is canonical.
    pub parents: Vec<(String, Pointer)>,
    pub when: i64,
    pub host: String,
}

impl RevisionRecord {
    pub fn base_parent(&self) -> Option<Pointer> {
        self.parents
            .iter()
            .find(|(name, _)| name == BASE_TAG)
            .map(|(_, p)| *p)
    }
}

// --- primitive helpers -------------------------------------------------

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_u16(buf, s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}
fn write_ref(buf: &mut Vec<u8>, r: &BlockRef) -> Result<()> {
    let bytes = r.encode()?;
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(&bytes);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::InvalidArgument);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidArgument)
    }
    fn reference(&mut self) -> Result<BlockRef> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        BlockRef::decode(bytes)
    }
}

// --- node ---------------------------------------------------------------

const FLAG_SEALED: u8 = 1 << 0;
const FLAG_UNLINKED: u8 = 1 << 1;

pub fn encode_node(node: &NodeRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(NODE_VERSION);
    write_u64(&mut buf, node.id);
    write_u32(&mut buf, node.version);
    write_string(&mut buf, &node.name);
    let mut flags = 0u8;
    if node.sealed {
        flags |= FLAG_SEALED;
    }
    if node.unlinked {
        flags |= FLAG_UNLINKED;
    }
    buf.push(flags);
    write_u32(&mut buf, node.block_size);
    write_u32(&mut buf, node.mode);
    write_u64(&mut buf, node.size);
    write_u32(&mut buf, node.modified);
    write_u32(&mut buf, node.children.len() as u32);
    for child in &node.children {
        write_ref(&mut buf, child)?;
    }
    write_u32(&mut buf, node.blocks.len() as u32);
    for block in &node.blocks {
        write_ref(&mut buf, block)?;
    }
    Ok(buf)
}

pub fn decode_node(bytes: &[u8]) -> Result<NodeRecord> {
    let mut cur = Cursor::new(bytes);
    let version = cur.u8()?;
    if version != NODE_VERSION {
        return Err(Error::CodecUnknownVersion(version));
    }
    let id = cur.u64()?;
    let node_version = cur.u32()?;
    let name = cur.string()?;
    let flags = cur.u8()?;
    let block_size = cur.u32()?;
    let mode = cur.u32()?;
    let size = cur.u64()?;
    let modified = cur.u32()?;
    let child_count = cur.u32()?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(cur.reference()?);
    }
    let block_count = cur.u32()?;
    let mut blocks = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        blocks.push(cur.reference()?);
    }
    Ok(NodeRecord {
        id,
        version: node_version,
        name,
        sealed: flags & FLAG_SEALED != 0,
        unlinked: flags & FLAG_UNLINKED != 0,
        block_size,
        mode,
        size,
        modified,
        children,
        blocks,
    })
}

// --- revision -------------------------------------------------------------

pub fn encode_revision(rev: &RevisionRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.push(REVISION_VERSION);
    let root_bytes = rev.root.as_bytes();
    buf.push(root_bytes.len() as u8);
    buf.extend_from_slice(root_bytes);
    write_u16(&mut buf, rev.parents.len() as u16);
    for (name, ptr) in &rev.parents {
        write_string(&mut buf, name);
        let bytes = ptr.as_bytes();
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    write_i64(&mut buf, rev.when);
    write_string(&mut buf, &rev.host);
    Ok(buf)
}

pub fn decode_revision(bytes: &[u8]) -> Result<RevisionRecord> {
    let mut cur = Cursor::new(bytes);
    let version = cur.u8()?;
    match version {
        REVISION_VERSION => decode_revision_v16(&mut cur),
        REVISION_VERSION_LEGACY_SINGLE_PARENT => decode_revision_v15(&mut cur),
        other => Err(Error::CodecUnknownVersion(other)),
    }
}

fn read_pointer(cur: &mut Cursor<'_>) -> Result<Pointer> {
    let len = cur.u8()? as usize;
    let bytes = cur.take(len)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidArgument)?;
    Ok(Pointer::from_hash(arr))
}

fn decode_revision_v16(cur: &mut Cursor<'_>) -> Result<RevisionRecord> {
    let root = read_pointer(cur)?;
    let parent_count = cur.u16()?;
    let mut parents = Vec::with_capacity(parent_count as usize);
    for _ in 0..parent_count {
        let name = cur.string()?;
        let ptr = read_pointer(cur)?;
        parents.push((name, ptr));
    }
    let when = cur.i64()?;
    let host = cur.string()?;
    Ok(RevisionRecord { root, parents, when, host })
}

fn decode_revision_v15(cur: &mut Cursor<'_>) -> Result<RevisionRecord> {
    let root = read_pointer(cur)?;
    let parent = read_pointer(cur)?;
    let when = cur.i64()?;
    let host = cur.string()?;
    let parents = if parent.is_null() {
        Vec::new()
    } else {
        vec![(BASE_TAG.to_string(), parent)]
    };
    Ok(RevisionRecord { root, parents, when, host })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> NodeRecord {
        NodeRecord {
            id: 42,
            version: 3,
            name: "dir".into(),
            sealed: true,
            unlinked: false,
            block_size: 1024 * 1024,
            mode: 0o755,
            size: 0,
            modified: 1_700_000_000,
            children: vec![BlockRef::Sealed(Pointer::from_hash([1u8; 32]))],
            blocks: vec![],
        }
    }

    #[test]
    fn node_round_trips() {
        let n = sample_node();
        let bytes = encode_node(&n).unwrap();
        assert_eq!(bytes[0], NODE_VERSION);
        let back = decode_node(&bytes).unwrap();
        assert_eq!(n, back);
    }

    #[test]
    fn node_rejects_staging_child() {
        let mut n = sample_node();
        n.children = vec![BlockRef::Staging("abc".into())];
        assert!(encode_node(&n).is_err());
    }

    #[test]
    fn node_unknown_version_is_rejected() {
        let n = sample_node();
        let mut bytes = encode_node(&n).unwrap();
        bytes[0] = 200;
        assert!(matches!(decode_node(&bytes), Err(Error::CodecUnknownVersion(200))));
    }

    fn sample_revision() -> RevisionRecord {
        RevisionRecord {
            root: Pointer::from_hash([2u8; 32]),
            parents: vec![(BASE_TAG.to_string(), Pointer::from_hash([3u8; 32]))],
            when: 1_700_000_123,
            host: "host-a".into(),
        }
    }

    #[test]
    fn revision_round_trips() {
        let r = sample_revision();
        let bytes = encode_revision(&r).unwrap();
        assert_eq!(bytes[0], REVISION_VERSION);
        let back = decode_revision(&bytes).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn legacy_v15_single_parent_maps_to_base_tag() {
        let mut buf = Vec::new();
        buf.push(REVISION_VERSION_LEGACY_SINGLE_PARENT);
        let root = Pointer::from_hash([4u8; 32]);
        buf.push(32);
        buf.extend_from_slice(root.as_bytes());
        let parent = Pointer::from_hash([5u8; 32]);
        buf.push(32);
        buf.extend_from_slice(parent.as_bytes());
        buf.extend_from_slice(&1_650_000_000i64.to_le_bytes());
        write_string(&mut buf, "legacy-host");

        let decoded = decode_revision(&buf).unwrap();
        assert_eq!(decoded.root, root);
        assert_eq!(decoded.base_parent(), Some(parent));
        assert_eq!(decoded.host, "legacy-host");
    }
}
