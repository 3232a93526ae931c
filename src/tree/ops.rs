//! Tree construction, navigation, mutation, trimming, flush/seal and
//! push/pull (spec.md §4.F). One top-level mutex around a `Tree` is the
//! ops layer's job (§5); everything here assumes exclusive access except
//! the bounded-parallelism phase of `grow`, which only needs shared
//! access to the store.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use crate::block::{BlockFactory, BlockRef};
use crate::codec::NodeRecord;
use crate::concurrency::Semaphore;
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::revision::Revision;
use crate::treestore::{TreeStore, CANONICAL_TAG};

use super::arena::{Arena, NodeIndex};
use super::node::{now_secs, now_secs_i64, ChildEntry, ChildState, Node, DMDIR};

/// Bounded parallelism for loading a directory's unloaded children
/// (spec.md §4.F, §9).
pub const GROW_PARALLELISM: usize = 8;
/// Default snapshot frequency: a flush is skipped if one already
/// succeeded within this window (spec.md §4.F, §4.J).
pub const SNAPSHOT_FREQUENCY: Duration = Duration::from_secs(180);
/// A loaded node is eligible for trimming once it has been quiescent for
/// this long (spec.md §4.F "Trim").
pub const TRIM_QUIESCENCE: Duration = Duration::from_secs(300);

enum TreeSource {
    Empty,
    Root(Pointer),
    Revision(Pointer),
}

/// Builds a `Tree` from one of the sources described in spec.md §4.F.
pub struct TreeBuilder {
    store: Arc<TreeStore>,
    factory: Arc<BlockFactory>,
    source: TreeSource,
    mutable: bool,
}

impl TreeBuilder {
    pub fn new(store: Arc<TreeStore>, factory: Arc<BlockFactory>) -> TreeBuilder {
        TreeBuilder { store, factory, source: TreeSource::Empty, mutable: false }
    }

    pub fn with_root(mut self, pointer: Pointer) -> TreeBuilder {
        self.source = TreeSource::Root(pointer);
        self
    }

    pub fn with_revision(mut self, pointer: Pointer) -> TreeBuilder {
        self.source = TreeSource::Revision(pointer);
        self
    }

    pub fn with_mutable(mut self) -> TreeBuilder {
        self.mutable = true;
        self
    }

    pub fn build(self) -> Result<Tree> {
        let mut arena = Arena::new();
        let block_size = self.factory.capacity();
        let (root, revision) = match self.source {
            TreeSource::Empty => {
                let root = arena.insert(Node::new_root("root".to_string()));
                (root, Pointer::NULL)
            }
            TreeSource::Root(pointer) => {
                let record = self.store.load_node(pointer)?;
                let node = instantiate(&record, None, pointer);
                (arena.insert(node), Pointer::NULL)
            }
            TreeSource::Revision(pointer) => {
                let revision = self.store.load_revision(pointer)?;
                let record = self.store.load_node(revision.root_key)?;
                let node = instantiate(&record, None, revision.root_key);
                (arena.insert(node), pointer)
            }
        };
        Ok(Tree {
            store: self.store,
            factory: self.factory,
            arena,
            root,
            revision,
            block_size,
            mutable: self.mutable,
            ignored_conflicts: HashMap::new(),
            last_flush: None,
            last_trim: None,
        })
    }
}

fn block_sizes(total_size: u64, block_size: u32, count: usize) -> Vec<u32> {
    let mut sizes = Vec::with_capacity(count);
    let mut remaining = total_size;
    for i in 0..count {
        let size = if i + 1 == count { remaining } else { (block_size as u64).min(remaining) };
        sizes.push(size as u32);
        remaining = remaining.saturating_sub(size);
    }
    sizes
}

fn instantiate(record: &NodeRecord, parent: Option<NodeIndex>, pointer: Pointer) -> Node {
    let sizes = block_sizes(record.size, record.block_size, record.blocks.len());
    let blocks = record
        .blocks
        .iter()
        .cloned()
        .zip(sizes)
        .map(|(r, size)| crate::block::Block::from_ref(r, size))
        .collect();
    let children = record
        .children
        .iter()
        .map(|r| ChildEntry {
            state: match r {
                BlockRef::Sealed(p) => ChildState::Unloaded(*p),
                BlockRef::Staging(_) => ChildState::Unloaded(Pointer::NULL),
            },
        })
        .collect();
    Node {
        id: record.id,
        version: record.version,
        name: record.name.clone(),
        mode: record.mode,
        modified: record.modified,
        size: record.size,
        block_size: record.block_size,
        children,
        blocks,
        parent,
        loaded: true,
        dirty: false,
        sealed: record.sealed,
        unlinked: record.unlinked,
        refcount: 0,
        pointer,
    }
}

fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() || path == "." || path == "/" || path.starts_with('/') || path.starts_with("./") {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn is_component_prefix(prefix: &str, path: &str) -> bool {
    if prefix == path {
        return true;
    }
    path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/')
}

fn paths_nest(a: &str, b: &str) -> bool {
    is_component_prefix(a, b) || is_component_prefix(b, a)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// A mutable (or read-only) in-memory handle onto a content-addressed
/// tree (spec.md §3 "Tree").
pub struct Tree {
    store: Arc<TreeStore>,
    factory: Arc<BlockFactory>,
    arena: Arena,
    root: NodeIndex,
    revision: Pointer,
    block_size: u32,
    mutable: bool,
    ignored_conflicts: HashMap<String, HashSet<String>>,
    last_flush: Option<Instant>,
    last_trim: Option<Instant>,
}

impl Tree {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn revision(&self) -> Pointer {
        self.revision
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    pub fn get(&self, idx: NodeIndex) -> Result<&Node> {
        self.arena.get(idx).ok_or(Error::NotExist)
    }

    fn get_mut(&mut self, idx: NodeIndex) -> Result<&mut Node> {
        self.arena.get_mut(idx).ok_or(Error::NotExist)
    }

    /// Path of a node relative to the tree root, `/`-joined.
    pub fn path_of(&self, idx: NodeIndex) -> Result<String> {
        let mut parts = Vec::new();
        let mut cursor = idx;
        loop {
            let node = self.get(cursor)?;
            match node.parent {
                Some(parent) => {
                    parts.push(node.name.clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    fn mark_dirty_to_root(&mut self, mut idx: NodeIndex) -> Result<()> {
        loop {
            let node = self.get_mut(idx)?;
            if node.dirty {
                break;
            }
            node.dirty = true;
            match node.parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }
        Ok(())
    }

    // --- navigation ---------------------------------------------------

    /// Load metadata for every not-yet-loaded child of `parent`, up to
    /// `GROW_PARALLELISM` concurrently. Returns the first error
    /// encountered; other errors are logged.
    pub fn grow(&mut self, parent: NodeIndex) -> Result<()> {
        let pending: Vec<(usize, Pointer)> = {
            let node = self.get(parent)?;
            node.children
                .iter()
                .enumerate()
                .filter_map(|(i, c)| match c.state {
                    ChildState::Unloaded(p) if !p.is_null() => Some((i, p)),
                    _ => None,
                })
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let semaphore = Semaphore::new(GROW_PARALLELISM);
        let store = self.store.clone();
        let results: Vec<(usize, Pointer, Result<NodeRecord>)> = thread::scope(|scope| {
            let handles: Vec<_> = pending
                .iter()
                .map(|&(i, pointer)| {
                    let semaphore = &semaphore;
                    let store = &store;
                    scope.spawn(move || {
                        let _permit = semaphore.acquire();
                        (i, pointer, store.load_node(pointer))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("grow worker panicked")).collect()
        });

        let mut first_err = None;
        for (i, pointer, result) in results {
            match result {
                Ok(record) => {
                    let child = instantiate(&record, Some(parent), pointer);
                    let idx = self.arena.insert(child);
                    if let Some(node) = self.arena.get_mut(parent) {
                        node.children[i].state = ChildState::Loaded(idx);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        warn!("grow: child load failed: {e}");
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn walk_one(&mut self, current: NodeIndex, name: &str) -> Result<NodeIndex> {
        if name == ".." {
            let node = self.get(current)?;
            return Ok(node.parent.unwrap_or(current));
        }
        self.grow(current)?;
        let node = self.get(current)?;
        if !node.is_dir() {
            return Err(Error::NotDir);
        }
        for child in &node.children {
            if let ChildState::Loaded(idx) = child.state {
                if self.arena.get(idx).map(|n| n.name.as_str()) == Some(name) {
                    return Ok(idx);
                }
            }
        }
        Err(Error::NotExist)
    }

    /// Follow `names` through `source`'s children one at a time. Returns
    /// the prefix of visited nodes; `NotExist` only if the very first
    /// step fails.
    pub fn walk(&mut self, source: NodeIndex, names: &[&str]) -> Result<Vec<NodeIndex>> {
        if !self.get(source)?.loaded {
            return Err(Error::InvalidArgument);
        }
        let mut visited = Vec::with_capacity(names.len());
        let mut current = source;
        for (i, name) in names.iter().enumerate() {
            match self.walk_one(current, name) {
                Ok(idx) => {
                    visited.push(idx);
                    current = idx;
                }
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    return Ok(visited);
                }
            }
        }
        Ok(visited)
    }

    /// Resolve a `/`-separated relative path from the tree root.
    pub fn walk_path(&mut self, path: &str) -> Result<NodeIndex> {
        let parts = split_path(path);
        if parts.is_empty() {
            return Ok(self.root);
        }
        let visited = self.walk(self.root, &parts)?;
        if visited.len() != parts.len() {
            return Err(Error::NotExist);
        }
        Ok(*visited.last().unwrap())
    }

    // --- reference counting --------------------------------------------

    pub fn reference(&mut self, node: NodeIndex) {
        let mut cursor = Some(node);
        while let Some(idx) = cursor {
            match self.arena.get_mut(idx) {
                Some(n) => {
                    n.refcount += 1;
                    cursor = n.parent;
                }
                None => break,
            }
        }
    }

    pub fn unreference(&mut self, node: NodeIndex) {
        let mut cursor = Some(node);
        while let Some(idx) = cursor {
            match self.arena.get_mut(idx) {
                Some(n) => {
                    n.refcount = n.refcount.saturating_sub(1);
                    cursor = n.parent;
                }
                None => break,
            }
        }
        if let Some(n) = self.arena.get(node) {
            if n.unlinked && n.refcount == 0 {
                self.discard_subtree(node);
            }
        }
    }

    fn discard_subtree(&mut self, idx: NodeIndex) {
        let node = match self.arena.remove(idx) {
            Some(n) => n,
            None => return,
        };
        for mut block in node.blocks {
            block.discard(&self.factory);
        }
        for child in node.children {
            if let ChildState::Loaded(child_idx) = child.state {
                self.discard_subtree(child_idx);
            }
        }
    }

    pub fn list_nodes_in_use(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (idx, node) in self.arena.iter() {
            if node.refcount > 0 {
                if let Ok(path) = self.path_of(idx) {
                    out.push(path);
                }
            }
        }
        out
    }

    // --- mutations -------------------------------------------------------

    pub fn add(&mut self, parent: NodeIndex, name: &str, mode: u32) -> Result<NodeIndex> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(Error::InvalidArgument);
        }
        self.grow(parent)?;
        {
            let node = self.get(parent)?;
            if !node.is_dir() {
                return Err(Error::NotDir);
            }
        }
        if self.walk_one(parent, name).is_ok() {
            return Err(Error::Exist);
        }
        let now = now_secs();
        let child = Node {
            id: super::node::now_ns(),
            version: 1,
            name: name.to_string(),
            mode,
            modified: now,
            size: 0,
            block_size: self.block_size,
            children: Vec::new(),
            blocks: Vec::new(),
            parent: Some(parent),
            loaded: true,
            dirty: true,
            sealed: false,
            unlinked: false,
            refcount: 0,
            pointer: Pointer::NULL,
        };
        let idx = self.arena.insert(child);
        {
            let parent_node = self.get_mut(parent)?;
            parent_node.children.push(ChildEntry { state: ChildState::Loaded(idx) });
            parent_node.modified = now;
        }
        self.mark_dirty_to_root(parent)?;
        Ok(idx)
    }

    pub fn unlink(&mut self, node: NodeIndex) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        let parent = self.get(node)?.parent.ok_or(Error::PermissionDenied)?;
        if self.get(node)?.is_dir() {
            self.grow(node)?;
            if !self.get(node)?.children.is_empty() {
                return Err(Error::NotEmpty);
            }
        }
        {
            let parent_node = self.get_mut(parent)?;
            parent_node.children.retain(|c| !matches!(c.state, ChildState::Loaded(i) if i == node));
            parent_node.modified = now_secs();
        }
        self.get_mut(node)?.unlinked = true;
        self.mark_dirty_to_root(parent)?;
        if self.get(node)?.refcount == 0 {
            self.discard_subtree(node);
        }
        Ok(())
    }

    pub fn rename(&mut self, node: NodeIndex, new_name: &str) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
            return Err(Error::InvalidArgument);
        }
        let parent = self.get(node)?.parent.ok_or(Error::PermissionDenied)?;
        self.grow(parent)?;
        if let Ok(existing) = self.walk_one(parent, new_name) {
            if existing != node {
                let removable = {
                    let n = self.get(existing)?;
                    !n.is_dir() || n.children.is_empty()
                };
                if !removable {
                    return Err(Error::NotEmpty);
                }
                self.unlink(existing)?;
            }
        }
        let now = now_secs();
        {
            let n = self.get_mut(node)?;
            n.name = new_name.to_string();
        }
        {
            let parent_node = self.get_mut(parent)?;
            parent_node.modified = now;
        }
        self.mark_dirty_to_root(node)?;
        Ok(())
    }

    /// Apply a metadata-only `mode`/`mtime` patch (spec.md §4.I wstat).
    /// Permission bits and `DMEXCL`/`DMAPPEND` may change; `DMDIR` is
    /// fixed at creation and not touched here. Neither field bump is
    /// content-changing, so `version` is left alone.
    pub fn set_attr(&mut self, node: NodeIndex, mode: Option<u32>, mtime: Option<u32>) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        {
            let n = self.get_mut(node)?;
            if let Some(mode) = mode {
                n.mode = (n.mode & DMDIR) | (mode & !DMDIR);
            }
            if let Some(mtime) = mtime {
                n.modified = mtime;
            }
        }
        self.mark_dirty_to_root(node)?;
        Ok(())
    }

    /// Path-level rename, used by the control file's `rename` command.
    pub fn rename_path(&mut self, source_path: &str, target_path: &str) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        validate_relative_path(source_path)?;
        validate_relative_path(target_path)?;
        if paths_nest(source_path, target_path) {
            return Err(Error::InvalidArgument);
        }

        let source_parts = split_path(source_path);
        let visited = self.walk(self.root, &source_parts)?;
        if visited.len() != source_parts.len() {
            return Err(Error::NotExist);
        }
        let source_node = *visited.last().unwrap();

        let target_parts = split_path(target_path);
        let (parent_parts, name_part) = target_parts.split_at(target_parts.len() - 1);
        let target_name = name_part[0];
        let target_parent = if parent_parts.is_empty() {
            self.root
        } else {
            let visited = self.walk(self.root, parent_parts)?;
            if visited.len() != parent_parts.len() {
                return Err(Error::NotExist);
            }
            *visited.last().unwrap()
        };

        if self.get(source_node)?.refcount > 0 {
            return Err(Error::Busy);
        }
        if let Ok(existing) = self.walk_one(target_parent, target_name) {
            if self.get(existing)?.refcount > 0 {
                return Err(Error::Busy);
            }
            if existing != source_node {
                let removable = {
                    let n = self.get(existing)?;
                    !n.is_dir() || n.children.is_empty()
                };
                if !removable {
                    return Err(Error::NotEmpty);
                }
                self.unlink(existing)?;
            }
        }

        let old_parent = self.get(source_node)?.parent.ok_or(Error::PermissionDenied)?;
        let now = now_secs();
        {
            let parent_node = self.get_mut(old_parent)?;
            parent_node.children.retain(|c| !matches!(c.state, ChildState::Loaded(i) if i == source_node));
            parent_node.modified = now;
        }
        self.mark_dirty_to_root(old_parent)?;
        {
            let node = self.get_mut(source_node)?;
            node.name = target_name.to_string();
            node.parent = Some(target_parent);
        }
        {
            let parent_node = self.get_mut(target_parent)?;
            parent_node.children.push(ChildEntry { state: ChildState::Loaded(source_node) });
            parent_node.modified = now;
        }
        self.mark_dirty_to_root(target_parent)?;
        Ok(())
    }

    pub fn truncate(&mut self, node: NodeIndex, size: u64) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        if self.get(node)?.is_dir() {
            return Err(Error::IsDir);
        }
        let block_size = self.block_size as u64;
        let needed_blocks = if size == 0 { 0 } else { ((size - 1) / block_size + 1) as usize };
        let factory = self.factory.clone();
        {
            let n = self.get_mut(node)?;
            while n.blocks.len() < needed_blocks {
                n.blocks.push(factory.new_block());
            }
            n.blocks.truncate(needed_blocks);
            if let Some(last) = n.blocks.last_mut() {
                let last_size = size - (needed_blocks as u64 - 1) * block_size;
                last.truncate(&factory, last_size as u32)?;
            }
            n.size = size;
            n.version += 1;
            n.modified = now_secs();
        }
        self.mark_dirty_to_root(node)?;
        Ok(())
    }

    pub fn write_at(&mut self, node: NodeIndex, bytes: &[u8], offset: u64) -> Result<u64> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        if self.get(node)?.is_dir() {
            return Err(Error::IsDir);
        }
        let block_size = self.block_size as u64;
        let factory = self.factory.clone();
        let offset = if self.get(node)?.is_append() { self.get(node)?.size } else { offset };

        let mut written_total = 0u64;
        {
            let n = self.get_mut(node)?;
            let mut remaining = bytes;
            let mut cursor = offset;
            while !remaining.is_empty() {
                let block_idx = (cursor / block_size) as usize;
                let in_block_offset = (cursor % block_size) as u32;
                while n.blocks.len() <= block_idx {
                    n.blocks.push(factory.new_block());
                }
                let (written, _delta) = n.blocks[block_idx].write(&factory, remaining, in_block_offset)?;
                if written == 0 {
                    break;
                }
                written_total += written as u64;
                cursor += written as u64;
                remaining = &remaining[written as usize..];
            }
            n.size = n.size.max(offset + written_total);
            n.version += 1;
            n.modified = now_secs();
        }
        self.mark_dirty_to_root(node)?;
        Ok(written_total)
    }

    pub fn read_at(&self, node: NodeIndex, buf: &mut [u8], offset: u64) -> Result<u32> {
        let n = self.get(node)?;
        if n.is_dir() {
            return Err(Error::IsDir);
        }
        if offset >= n.size {
            return Ok(0);
        }
        let block_size = self.block_size as u64;
        let mut total = 0usize;
        let mut cursor = offset;
        while total < buf.len() && cursor < n.size {
            let block_idx = (cursor / block_size) as usize;
            let in_block_offset = (cursor % block_size) as u32;
            let block = match n.blocks.get(block_idx) {
                Some(b) => b,
                None => break,
            };
            let space = (buf.len() - total).min(block_size as usize);
            let mut tmp = vec![0u8; space];
            let read = block.read(&self.factory, &mut tmp, in_block_offset)? as usize;
            if read == 0 {
                break;
            }
            buf[total..total + read].copy_from_slice(&tmp[..read]);
            total += read;
            cursor += read as u64;
        }
        Ok(total as u32)
    }

    /// Attach a node loaded fresh from `donor_pointer` as a child of
    /// `receiver` under `name`, replacing any existing child of that name.
    pub fn graft(&mut self, receiver: NodeIndex, donor_pointer: Pointer, name: &str) -> Result<()> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        self.grow(receiver)?;
        if !self.get(receiver)?.is_dir() {
            return Err(Error::NotDir);
        }
        if let Ok(existing) = self.walk_one(receiver, name) {
            if self.get(existing)?.refcount > 0 {
                return Err(Error::Busy);
            }
            self.unlink(existing)?;
        }
        let record = self.store.load_node(donor_pointer)?;
        let mut donor = instantiate(&record, Some(receiver), donor_pointer);
        donor.name = name.to_string();
        donor.dirty = true;
        let idx = self.arena.insert(donor);
        {
            let parent_node = self.get_mut(receiver)?;
            parent_node.children.push(ChildEntry { state: ChildState::Loaded(idx) });
            parent_node.modified = now_secs();
        }
        self.mark_dirty_to_root(receiver)?;
        Ok(())
    }

    // --- trim ------------------------------------------------------------

    pub fn trim(&mut self) {
        let now = now_secs();
        self.trim_node(self.root, now);
        self.last_trim = Some(Instant::now());
    }

    pub fn should_trim(&self) -> bool {
        match self.last_trim {
            Some(t) => t.elapsed() >= Duration::from_secs(60),
            None => true,
        }
    }

    fn trim_node(&mut self, node: NodeIndex, now: u32) {
        let child_indices: Vec<NodeIndex> = match self.arena.get(node) {
            Some(n) if n.loaded => n
                .children
                .iter()
                .filter_map(|c| match c.state {
                    ChildState::Loaded(i) => Some(i),
                    ChildState::Unloaded(_) => None,
                })
                .collect(),
            _ => return,
        };
        for child in child_indices {
            self.trim_node(child, now);
        }
        if node == self.root {
            return;
        }
        let (dirty, refcount, modified, pointer, parent) = match self.arena.get(node) {
            Some(n) => (n.dirty, n.refcount, n.modified, n.pointer, n.parent),
            None => return,
        };
        if dirty || refcount > 0 || pointer.is_null() {
            return;
        }
        if now.saturating_sub(modified) < TRIM_QUIESCENCE.as_secs() as u32 {
            return;
        }
        if let Some(parent_idx) = parent {
            if let Some(parent_node) = self.arena.get_mut(parent_idx) {
                for c in &mut parent_node.children {
                    if matches!(c.state, ChildState::Loaded(i) if i == node) {
                        c.state = ChildState::Unloaded(pointer);
                    }
                }
            }
        }
        self.arena.remove(node);
    }

    // --- flush / seal ------------------------------------------------------

    pub fn flush(&mut self) -> Result<Pointer> {
        let pointer = self.flush_node(self.root, false)?;
        self.last_flush = Some(Instant::now());
        Ok(pointer)
    }

    pub fn seal(&mut self) -> Result<Pointer> {
        let pointer = self.flush_node(self.root, true)?;
        self.last_flush = Some(Instant::now());
        Ok(pointer)
    }

    pub fn flush_if_not_done_recently(&mut self) -> Result<Option<Pointer>> {
        if let Some(last) = self.last_flush {
            if last.elapsed() < SNAPSHOT_FREQUENCY {
                return Ok(None);
            }
        }
        Ok(Some(self.flush()?))
    }

    fn flush_node(&mut self, idx: NodeIndex, seal: bool) -> Result<Pointer> {
        let dirty = self.get(idx)?.dirty;
        if !dirty && !seal {
            return Ok(self.get(idx)?.pointer);
        }

        let child_count = self.get(idx)?.children.len();
        for i in 0..child_count {
            let state = self.get(idx)?.children[i].state;
            if let ChildState::Loaded(child_idx) = state {
                let needs_flush = {
                    let c = self.get(child_idx)?;
                    c.dirty || (seal && !c.sealed)
                };
                if needs_flush {
                    self.flush_node(child_idx, seal)?;
                }
            }
        }

        let factory = self.factory.clone();
        {
            let n = self.get_mut(idx)?;
            for block in &mut n.blocks {
                if seal {
                    block.seal(&factory)?;
                } else {
                    block.flush(&factory)?;
                }
            }
        }

        let record = self.to_record(idx)?;
        let new_pointer = if seal { self.store.seal_node(&record)? } else { self.store.store_node(&record)? };

        let n = self.get_mut(idx)?;
        n.pointer = new_pointer;
        n.dirty = false;
        if seal {
            n.sealed = true;
        }
        Ok(new_pointer)
    }

    fn to_record(&self, idx: NodeIndex) -> Result<NodeRecord> {
        let n = self.get(idx)?;
        let mut children = Vec::with_capacity(n.children.len());
        for c in &n.children {
            let pointer = match c.state {
                ChildState::Loaded(child_idx) => self.get(child_idx)?.pointer,
                ChildState::Unloaded(p) => p,
            };
            children.push(BlockRef::Sealed(pointer));
        }
        let blocks = n.blocks.iter().map(|b| b.reference()).collect();
        Ok(NodeRecord {
            id: n.id,
            version: n.version,
            name: n.name.clone(),
            sealed: n.sealed,
            unlinked: n.unlinked,
            block_size: n.block_size,
            mode: n.mode,
            size: n.size,
            modified: n.modified,
            children,
            blocks,
        })
    }

    // --- push / pull -------------------------------------------------------

    pub fn ignore(&mut self, revision_hex: &str, path: &str) {
        self.ignored_conflicts.entry(revision_hex.to_string()).or_default().insert(path.to_string());
    }

    pub fn ignored_conflicts(&self) -> &HashMap<String, HashSet<String>> {
        &self.ignored_conflicts
    }

    /// Prerequisite: `local_base == remote_base("base")`. Flushes, seals,
    /// creates and stores a new revision, and advances both base
    /// pointers.
    pub fn push(&mut self, additional_tag_names: &[&str]) -> Result<Revision> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        let local_base = self.store.local_base_pointer().unwrap_or(Pointer::NULL);
        let remote_base = self.store.remote_tag(CANONICAL_TAG).unwrap_or(Pointer::NULL);
        if local_base != remote_base {
            return Err(Error::Busy);
        }
        self.flush()?;
        let root_pointer = self.seal()?;

        let mut parents = vec![(CANONICAL_TAG.to_string(), remote_base)];
        for name in additional_tag_names {
            if let Ok(p) = self.store.remote_tag(name) {
                parents.push(((*name).to_string(), p));
            }
        }
        let mut revision = Revision::new(root_pointer, parents, hostname(), now_secs_i64());
        let pointer = self.store.store_revision(&revision)?;
        revision.pointer = pointer;

        let mut names: Vec<&str> = vec![CANONICAL_TAG];
        names.extend(additional_tag_names);
        self.store.set_remote_tags(&names, pointer)?;
        self.store.set_local_base_pointer(pointer)?;
        self.factory.paired().notify();

        Ok(revision)
    }

    /// Flushes, then either no-ops (bases already match) or computes and
    /// auto-executes the three-way worklog (spec.md §4.G), returning its
    /// text (including any unresolved conflict hints).
    pub fn pull(&mut self) -> Result<String> {
        if !self.mutable {
            return Err(Error::ReadOnly);
        }
        self.flush()?;
        let local_base = self.store.local_base_pointer().unwrap_or(Pointer::NULL);
        let remote_base = self.store.remote_tag(CANONICAL_TAG).unwrap_or(Pointer::NULL);
        if local_base == remote_base || local_base.is_null() {
            if local_base.is_null() && !remote_base.is_null() {
                self.store.set_local_base_pointer(remote_base)?;
            }
            return Ok(String::new());
        }

        let mut base_tree = TreeBuilder::new(self.store.clone(), self.factory.clone())
            .with_revision(local_base)
            .build()?;
        let mut remote_tree = TreeBuilder::new(self.store.clone(), self.factory.clone())
            .with_revision(remote_base)
            .build()?;

        let ignored = self.ignored_conflicts.clone();
        let remote_base_hex = remote_base.to_hex();
        let worklog = crate::merge::pull_worklog(self, &mut base_tree, &mut remote_tree, &ignored, &remote_base_hex)?;

        let remaining = self.apply_worklog(&worklog)?;
        if remaining.is_empty() {
            self.store.set_local_base_pointer(remote_base)?;
        }
        Ok(worklog.join("\n"))
    }

    /// Compute the pull worklog without executing any of it, for the
    /// control file's `diff` command.
    pub fn diff(&mut self) -> Result<String> {
        self.flush()?;
        let local_base = self.store.local_base_pointer().unwrap_or(Pointer::NULL);
        let remote_base = self.store.remote_tag(CANONICAL_TAG).unwrap_or(Pointer::NULL);
        if local_base == remote_base {
            return Ok(String::new());
        }
        let mut base_tree = TreeBuilder::new(self.store.clone(), self.factory.clone())
            .with_revision(local_base)
            .build()?;
        let mut remote_tree = TreeBuilder::new(self.store.clone(), self.factory.clone())
            .with_revision(remote_base)
            .build()?;
        let ignored = self.ignored_conflicts.clone();
        let remote_base_hex = remote_base.to_hex();
        let worklog = crate::merge::pull_worklog(self, &mut base_tree, &mut remote_tree, &ignored, &remote_base_hex)?;
        Ok(worklog.join("\n"))
    }

    fn apply_worklog(&mut self, lines: &[String]) -> Result<Vec<String>> {
        let mut unresolved = Vec::new();
        for line in lines {
            if line.starts_with('#') {
                unresolved.push(line.clone());
                continue;
            }
            let mut parts = line.splitn(2, ' ');
            match parts.next() {
                Some("flush") => {
                    self.flush()?;
                }
                Some("unlink") => {
                    if let Some(path) = parts.next() {
                        let idx = self.walk_path(path)?;
                        self.unlink(idx)?;
                    }
                }
                Some("graft2") => {
                    if let Some(rest) = parts.next() {
                        self.apply_graft2(rest)?;
                    }
                }
                Some("pull") => {}
                _ => unresolved.push(line.clone()),
            }
        }
        Ok(unresolved)
    }

    fn resolve_pointer_path(&self, root: Pointer, parts: &[&str]) -> Result<Pointer> {
        let mut current = root;
        for part in parts {
            let record = self.store.load_node(current)?;
            let mut found = None;
            for child_ref in &record.children {
                if let BlockRef::Sealed(p) = child_ref {
                    let child_record = self.store.load_node(*p)?;
                    if child_record.name == *part {
                        found = Some(*p);
                        break;
                    }
                }
            }
            current = found.ok_or(Error::NotExist)?;
        }
        Ok(current)
    }

    /// Resolve a revision's root by hex and graft the node at `sub_path`
    /// beneath it (empty `sub_path` grafts the revision's root itself)
    /// as `dst_path` in this tree. Backs the control file's `graft`
    /// command (spec.md §4.I).
    pub fn graft_from_revision(&mut self, revision_hex: &str, sub_path: &str, dst_path: &str) -> Result<()> {
        let revision_pointer: Pointer = revision_hex.parse().map_err(|_| Error::InvalidArgument)?;
        let revision = self.store.load_revision(revision_pointer)?;
        let donor_pointer = if sub_path.is_empty() {
            revision.root_key
        } else {
            self.resolve_pointer_path(revision.root_key, &split_path(sub_path))?
        };
        let dst_parts = split_path(dst_path);
        let (parent_parts, name_part) = dst_parts.split_at(dst_parts.len().saturating_sub(1));
        if name_part.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let parent = if parent_parts.is_empty() {
            self.root
        } else {
            let visited = self.walk(self.root, parent_parts)?;
            if visited.len() != parent_parts.len() {
                return Err(Error::NotExist);
            }
            *visited.last().unwrap()
        };
        self.graft(parent, donor_pointer, name_part[0])
    }

    /// Apply a single `graft2 <src> <dst>` worklog command directly, for
    /// the control file's `graft2` command (spec.md §4.I).
    pub(crate) fn apply_graft2(&mut self, args: &str) -> Result<()> {
        let mut it = args.split_whitespace();
        let src = it.next().ok_or(Error::InvalidArgument)?;
        let dst = it.next().ok_or(Error::InvalidArgument)?;

        let (src_hex, src_path) = match src.split_once('/') {
            Some((hex, path)) => (hex, Some(path)),
            None => (src, None),
        };
        let src_pointer: Pointer = src_hex.parse().map_err(|_| Error::InvalidArgument)?;
        let donor_pointer = match src_path {
            Some(path) => self.resolve_pointer_path(src_pointer, &split_path(path))?,
            None => src_pointer,
        };

        let dst_parts = split_path(dst);
        let (dst_parent_parts, dst_name) = dst_parts.split_at(dst_parts.len().saturating_sub(1));
        if dst_name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let parent = if dst_parent_parts.is_empty() {
            self.root
        } else {
            let visited = self.walk(self.root, dst_parent_parts)?;
            if visited.len() != dst_parent_parts.len() {
                return Err(Error::NotExist);
            }
            *visited.last().unwrap()
        };
        self.graft(parent, donor_pointer, dst_name[0])
    }
}

fn hostname() -> String {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TreeKey;
    use crate::store::disk::DiskStore;
    use crate::store::paired::PairedStore;

    fn new_tree(tmp: &std::path::Path) -> Tree {
        let staging = Arc::new(DiskStore::new(tmp.join("staging")).unwrap());
        let cache = Arc::new(DiskStore::new(tmp.join("cache")).unwrap());
        let remote = Arc::new(DiskStore::new(tmp.join("remote")).unwrap());
        let paired =
            Arc::new(PairedStore::new(cache.clone(), remote.clone(), &tmp.join("propagation.log")).unwrap());
        let factory = Arc::new(BlockFactory::new(
            4096,
            TreeKey::from_bytes([1u8; 32]),
            staging,
            cache,
            paired,
        ));
        let store = Arc::new(TreeStore::new(tmp.to_path_buf(), factory.clone(), remote));
        TreeBuilder::new(store, factory).with_mutable().build().unwrap()
    }

    #[test]
    fn add_then_walk_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let dirnode = tree.add(root, "d", 0o755 | super::super::node::DMDIR).unwrap();
        let file = tree.add(dirnode, "f", 0o644).unwrap();
        let visited = tree.walk(root, &["d", "f"]).unwrap();
        assert_eq!(visited, vec![dirnode, file]);
        assert_eq!(tree.get(file).unwrap().version, 1);
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        tree.add(root, "f", 0o644).unwrap();
        assert!(matches!(tree.add(root, "f", 0o644), Err(Error::Exist)));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let file = tree.add(root, "f", 0o644).unwrap();
        tree.write_at(file, b"hello world", 0).unwrap();
        let mut buf = [0u8; 11];
        let n = tree.read_at(file, &mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn truncate_then_read_past_end_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let file = tree.add(root, "f", 0o644).unwrap();
        tree.write_at(file, b"hi", 0).unwrap();
        tree.truncate(file, 2).unwrap();
        let mut buf = [0xffu8; 4];
        let n = tree.read_at(file, &mut buf, 2).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn rename_moves_node_and_old_name_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let a = tree.add(root, "a", 0o755 | super::super::node::DMDIR).unwrap();
        let x = tree.add(a, "x", 0o644).unwrap();
        tree.write_at(x, b"hello world", 0).unwrap();
        let b = tree.add(root, "b", 0o755 | super::super::node::DMDIR).unwrap();

        tree.rename_path("a/x", "b/new").unwrap();
        assert!(matches!(tree.walk(root, &["a", "x"]), Err(Error::NotExist)));
        let moved = tree.walk(root, &["b", "new"]).unwrap();
        assert_eq!(moved.len(), 2);
        let _ = b;
    }

    #[test]
    fn unlink_non_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let d = tree.add(root, "d", 0o755 | super::super::node::DMDIR).unwrap();
        tree.add(d, "f", 0o644).unwrap();
        assert!(matches!(tree.unlink(d), Err(Error::NotEmpty)));
    }

    #[test]
    fn flush_clears_dirty_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let file = tree.add(root, "f", 0o644).unwrap();
        tree.write_at(file, b"data", 0).unwrap();
        tree.flush().unwrap();
        assert!(!tree.get(file).unwrap().dirty);
        assert!(!tree.get(root).unwrap().dirty);
    }

    #[test]
    fn seal_marks_sealed_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let file = tree.add(root, "f", 0o644).unwrap();
        tree.write_at(file, b"data", 0).unwrap();
        let root_pointer = tree.seal().unwrap();
        assert!(tree.get(file).unwrap().sealed);
        assert!(!root_pointer.is_null());
    }

    #[test]
    fn trim_unloads_quiescent_sealed_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let file = tree.add(root, "f", 0o644).unwrap();
        tree.write_at(file, b"data", 0).unwrap();
        tree.seal().unwrap();
        if let Some(n) = tree.arena.get_mut(file) {
            n.modified = n.modified.saturating_sub(TRIM_QUIESCENCE.as_secs() as u32 + 1);
        }
        tree.trim();
        assert!(tree.arena.get(file).is_none());
        let reloaded = tree.walk(root, &["f"]).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
