//! Request handlers (spec.md §4.I): attach/walk/open/create/read/write/
//! clunk/remove/stat/wstat, dispatched against a fid table and a single
//! tree mutex. The synthetic `muscle` root (children `ctl` and `live`)
//! and the `ctl` file's own command buffer live here too.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::locks::LockTable;
use crate::proto::{DirEntry, Qid, SUPPORTED_MODE_BITS};
use crate::tree::{Tree, DMDIR, DMEXCL, UNSUPPORTED_MODE_BITS};

use super::control::ControlFile;
use super::dirbuf;
use super::fid::{Aux, Fid, FidState, FidTable};

/// Open-mode bits this layer understands on top of the permission bits a
/// caller passes through; named after their 9p analogues since the
/// request contract (spec.md §4.I) is phrased in those terms.
pub const OTRUNC: u32 = 0x10;
pub const ORCLOSE: u32 = 0x40;

const TRIM_INTERVAL: Duration = Duration::from_secs(60);

/// Ties a mutable tree, its fid table, its lock table and its control
/// file together behind one mutex, per the single-tree-mutex scheduling
/// model (spec.md §5).
pub struct Filesystem {
    tree: Arc<Mutex<Tree>>,
    fids: Mutex<FidTable>,
    locks: LockTable,
    controls: Mutex<std::collections::HashMap<Fid, ControlFile>>,
    last_trim: Mutex<Option<Instant>>,
    uid: String,
    gid: String,
}

impl Filesystem {
    /// `tree` is shared with whatever background loops also flush it
    /// (spec.md §4.J); this layer never owns a private copy.
    pub fn new(tree: Arc<Mutex<Tree>>, uid: String, gid: String) -> Filesystem {
        Filesystem {
            tree,
            fids: Mutex::new(FidTable::new()),
            locks: LockTable::new(),
            controls: Mutex::new(std::collections::HashMap::new()),
            last_trim: Mutex::new(None),
            uid,
            gid,
        }
    }

    pub fn attach(&self, fid: Fid) {
        self.fids.lock().unwrap().insert(fid, FidState::new(Aux::SyntheticRoot));
    }

    /// Resolve `names` from `fid`'s current position, returning qids for
    /// however many resolved. A zero-length walk clones the fid in place.
    pub fn walk(&self, fid: Fid, new_fid: Fid, names: &[&str]) -> Result<Vec<Qid>> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };

        if names.is_empty() {
            let mut tree = self.tree.lock().unwrap();
            if let Aux::Node(idx) = aux {
                tree.reference(idx);
            }
            self.fids.lock().unwrap().insert(new_fid, FidState::new(aux));
            return Ok(Vec::new());
        }

        match aux {
            Aux::Control => Err(Error::PermissionDenied),
            Aux::SyntheticRoot => self.walk_synthetic(new_fid, names),
            Aux::Node(start) => {
                // The mutable tree root is a child of the synthetic root
                // (spec.md §9), so ".." from there surfaces it rather than
                // stopping at the tree root the way an ordinary parent walk
                // would.
                if names[0] == ".." && start == self.tree.lock().unwrap().root() {
                    let mut qids = vec![synthetic_root_qid()];
                    let rest = &names[1..];
                    if rest.is_empty() {
                        self.fids.lock().unwrap().insert(new_fid, FidState::new(Aux::SyntheticRoot));
                        return Ok(qids);
                    }
                    qids.extend(self.walk_synthetic(new_fid, rest)?);
                    return Ok(qids);
                }
                let mut tree = self.tree.lock().unwrap();
                let visited = tree.walk(start, names)?;
                let mut qids = Vec::with_capacity(visited.len());
                for &idx in &visited {
                    qids.push(Qid::from_node(tree.get(idx)?));
                }
                if visited.len() == names.len() {
                    let target = *visited.last().unwrap();
                    tree.reference(target);
                    self.fids.lock().unwrap().insert(new_fid, FidState::new(Aux::Node(target)));
                }
                Ok(qids)
            }
        }
    }

    /// Resolve `names` against the synthetic `muscle` root's two children.
    fn walk_synthetic(&self, new_fid: Fid, names: &[&str]) -> Result<Vec<Qid>> {
        if names.len() == 1 && names[0] == "ctl" {
            self.fids.lock().unwrap().insert(new_fid, FidState::new(Aux::Control));
            return Ok(vec![control_qid()]);
        }
        if names[0] != "live" {
            return Err(Error::NotExist);
        }
        let mut tree = self.tree.lock().unwrap();
        let root = tree.root();
        let rest = &names[1..];
        let mut qids = vec![Qid::from_node(tree.get(root)?)];
        if rest.is_empty() {
            tree.reference(root);
            self.fids.lock().unwrap().insert(new_fid, FidState::new(Aux::Node(root)));
            return Ok(qids);
        }
        let visited = tree.walk(root, rest)?;
        for &idx in &visited {
            qids.push(Qid::from_node(tree.get(idx)?));
        }
        if visited.len() == rest.len() {
            let target = *visited.last().unwrap();
            tree.reference(target);
            self.fids.lock().unwrap().insert(new_fid, FidState::new(Aux::Node(target)));
        }
        Ok(qids)
    }

    pub fn open(&self, fid: Fid, mode: u32) -> Result<Qid> {
        if mode & ORCLOSE != 0 {
            return Err(Error::PermissionDenied);
        }
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };
        match aux {
            Aux::Control => {
                self.controls.lock().unwrap().insert(fid, ControlFile::new());
                self.mark_open(fid, None);
                Ok(control_qid())
            }
            Aux::SyntheticRoot => {
                let entries = vec![synthetic_entry("ctl"), synthetic_entry("live")];
                self.mark_open(fid, Some(dirbuf::build(&entries)));
                Ok(synthetic_root_qid())
            }
            Aux::Node(idx) => {
                let mut tree = self.tree.lock().unwrap();
                let node = tree.get(idx)?;
                if node.unlinked {
                    return Err(Error::NotExist);
                }
                let is_dir = node.is_dir();
                let is_excl = node.is_excl();
                let is_append = node.is_append();
                let node_id = node.id;
                let qid = Qid::from_node(node);

                if is_excl {
                    self.locks.acquire(fid, node_id)?;
                }
                if mode & OTRUNC != 0 && !is_append {
                    tree.truncate(idx, 0)?;
                }
                if is_dir {
                    tree.grow(idx)?;
                    let node = tree.get(idx)?;
                    let entries: Vec<DirEntry> = children_entries(&tree, idx)?;
                    let _ = node;
                    self.mark_open(fid, Some(dirbuf::build(&entries)));
                } else {
                    self.mark_open(fid, None);
                }
                Ok(qid)
            }
        }
    }

    fn mark_open(&self, fid: Fid, dir_buffer: Option<Vec<u8>>) {
        if let Some(state) = self.fids.lock().unwrap().get_mut(fid) {
            state.open = true;
            state.dir_buffer = dir_buffer;
        }
    }

    pub fn create(&self, fid: Fid, name: &str, mode: u32) -> Result<Qid> {
        if mode & !SUPPORTED_MODE_BITS != 0 || mode & UNSUPPORTED_MODE_BITS != 0 {
            return Err(Error::InvalidArgument);
        }
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };
        let parent = match aux {
            Aux::Node(idx) => idx,
            _ => return Err(Error::PermissionDenied),
        };
        let mut tree = self.tree.lock().unwrap();
        if tree.get(parent)?.unlinked {
            return Err(Error::NotExist);
        }
        let child = tree.add(parent, name, mode)?;
        tree.reference(child);
        tree.unreference(parent);
        if mode & DMEXCL != 0 {
            let node_id = tree.get(child)?.id;
            self.locks.acquire(fid, node_id)?;
        }
        let qid = Qid::from_node(tree.get(child)?);
        self.fids.lock().unwrap().insert(fid, FidState::new(Aux::Node(child)));
        Ok(qid)
    }

    pub fn read(&self, fid: Fid, offset: u64, buf: &mut [u8]) -> Result<u32> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            let state = fids.get(fid).ok_or(Error::NotExist)?;
            if !state.open {
                return Err(Error::PermissionDenied);
            }
            state.aux
        };
        match aux {
            Aux::Control => {
                let controls = self.controls.lock().unwrap();
                let ctl = controls.get(&fid).ok_or(Error::NotExist)?;
                Ok(ctl.read_at(offset, buf))
            }
            Aux::SyntheticRoot => self.read_dir_buffer(fid, offset, buf),
            Aux::Node(idx) => {
                let tree = self.tree.lock().unwrap();
                if tree.get(idx)?.is_dir() {
                    drop(tree);
                    self.read_dir_buffer(fid, offset, buf)
                } else {
                    tree.read_at(idx, buf, offset)
                }
            }
        }
    }

    fn read_dir_buffer(&self, fid: Fid, offset: u64, buf: &mut [u8]) -> Result<u32> {
        let fids = self.fids.lock().unwrap();
        let state = fids.get(fid).ok_or(Error::NotExist)?;
        let dir_buffer = state.dir_buffer.as_deref().unwrap_or(&[]);
        let chunk = dirbuf::read_at(dir_buffer, offset, buf.len())?;
        buf[..chunk.len()].copy_from_slice(chunk);
        Ok(chunk.len() as u32)
    }

    pub fn write(&self, fid: Fid, offset: u64, data: &[u8]) -> Result<u32> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            let state = fids.get(fid).ok_or(Error::NotExist)?;
            if !state.open {
                return Err(Error::PermissionDenied);
            }
            state.aux
        };
        match aux {
            Aux::Control => {
                let text = std::str::from_utf8(data).map_err(|_| Error::InvalidArgument)?;
                let mut tree = self.tree.lock().unwrap();
                let mut controls = self.controls.lock().unwrap();
                let ctl = controls.get_mut(&fid).ok_or(Error::NotExist)?;
                for line in text.lines().filter(|l| !l.is_empty()) {
                    ctl.write(&mut tree, line)?;
                }
                Ok(data.len() as u32)
            }
            Aux::SyntheticRoot => Err(Error::PermissionDenied),
            Aux::Node(idx) => {
                let mut tree = self.tree.lock().unwrap();
                if tree.get(idx)?.is_dir() {
                    return Err(Error::IsDir);
                }
                let written = tree.write_at(idx, data, offset)?;
                Ok(written as u32)
            }
        }
    }

    pub fn clunk(&self, fid: Fid) {
        if let Some(state) = self.fids.lock().unwrap().remove(fid) {
            if let Aux::Node(idx) = state.aux {
                self.tree.lock().unwrap().unreference(idx);
            }
        }
        self.controls.lock().unwrap().remove(&fid);
        self.locks.release_all_for_fid(fid);

        let mut last_trim = self.last_trim.lock().unwrap();
        let due = match *last_trim {
            Some(t) => t.elapsed() >= TRIM_INTERVAL,
            None => true,
        };
        if due {
            self.tree.lock().unwrap().trim();
            *last_trim = Some(Instant::now());
        }
    }

    pub fn remove(&self, fid: Fid) -> Result<()> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };
        let idx = match aux {
            Aux::Node(idx) => idx,
            _ => return Err(Error::PermissionDenied),
        };
        let mut tree = self.tree.lock().unwrap();
        let result = tree.unlink(idx);
        drop(tree);
        self.clunk(fid);
        result
    }

    pub fn stat(&self, fid: Fid) -> Result<DirEntry> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };
        match aux {
            Aux::Control => Ok(control_entry()),
            Aux::SyntheticRoot => Ok(DirEntry {
                qid: synthetic_root_qid(),
                mode: DMDIR | 0o555,
                atime: 0,
                mtime: 0,
                length: 0,
                name: "muscle".to_string(),
                uid: self.uid.clone(),
                gid: self.gid.clone(),
                muid: self.uid.clone(),
            }),
            Aux::Node(idx) => {
                let tree = self.tree.lock().unwrap();
                Ok(DirEntry::from_node(tree.get(idx)?, &self.uid, &self.gid))
            }
        }
    }

    pub fn wstat(&self, fid: Fid, patch: &crate::proto::StatPatch) -> Result<()> {
        let aux = {
            let fids = self.fids.lock().unwrap();
            fids.get(fid).ok_or(Error::NotExist)?.aux
        };
        let idx = match aux {
            Aux::Node(idx) => idx,
            _ => return Err(Error::PermissionDenied),
        };
        if patch.gid.is_some() {
            return Err(Error::PermissionDenied);
        }
        let mut tree = self.tree.lock().unwrap();
        if let Some(name) = &patch.name {
            tree.rename(idx, name)?;
        }
        if let Some(mode) = patch.mode {
            if mode & !SUPPORTED_MODE_BITS != 0 {
                return Err(Error::PermissionDenied);
            }
        }
        if patch.mode.is_some() || patch.mtime.is_some() {
            tree.set_attr(idx, patch.mode, patch.mtime)?;
        }
        if let Some(length) = patch.length {
            let node = tree.get(idx)?;
            if node.is_dir() || node.is_append() {
                return Err(Error::PermissionDenied);
            }
            tree.truncate(idx, length)?;
        }
        Ok(())
    }
}

fn control_qid() -> Qid {
    Qid { qtype: crate::proto::QTFILE, version: 0, path: 1 }
}

fn synthetic_root_qid() -> Qid {
    Qid { qtype: crate::proto::QTDIR, version: 0, path: 0 }
}

fn control_entry() -> DirEntry {
    DirEntry {
        qid: control_qid(),
        mode: 0o600,
        atime: 0,
        mtime: 0,
        length: 0,
        name: "ctl".to_string(),
        uid: "muscle".to_string(),
        gid: "muscle".to_string(),
        muid: "muscle".to_string(),
    }
}

fn synthetic_entry(name: &str) -> DirEntry {
    if name == "ctl" {
        control_entry()
    } else {
        DirEntry {
            qid: Qid { qtype: crate::proto::QTDIR, version: 0, path: 2 },
            mode: DMDIR | 0o755,
            atime: 0,
            mtime: 0,
            length: 0,
            name: name.to_string(),
            uid: "muscle".to_string(),
            gid: "muscle".to_string(),
            muid: "muscle".to_string(),
        }
    }
}

fn children_entries(tree: &Tree, dir: crate::tree::NodeIndex) -> Result<Vec<DirEntry>> {
    let node = tree.get(dir)?;
    let mut out = Vec::with_capacity(node.children.len());
    for child in &node.children {
        if let crate::tree::ChildState::Loaded(idx) = child.state {
            out.push(DirEntry::from_node(tree.get(idx)?, "muscle", "muscle"));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockFactory;
    use crate::crypto::TreeKey;
    use crate::store::disk::DiskStore;
    use crate::store::paired::PairedStore;
    use crate::tree::TreeBuilder;

    fn new_fs(tmp: &std::path::Path) -> Filesystem {
        let staging = Arc::new(DiskStore::new(tmp.join("staging")).unwrap());
        let cache = Arc::new(DiskStore::new(tmp.join("cache")).unwrap());
        let remote = Arc::new(DiskStore::new(tmp.join("remote")).unwrap());
        let paired = Arc::new(PairedStore::new(cache.clone(), remote.clone(), &tmp.join("propagation.log")).unwrap());
        let factory = Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([2u8; 32]), staging, cache, paired));
        let store = Arc::new(crate::treestore::TreeStore::new(tmp.to_path_buf(), factory.clone(), remote));
        let tree = TreeBuilder::new(store, factory).with_mutable().build().unwrap();
        Filesystem::new(Arc::new(Mutex::new(tree)), "muscle".to_string(), "muscle".to_string())
    }

    #[test]
    fn attach_walk_ctl_and_live() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        let qids = fs.walk(1, 2, &["ctl"]).unwrap();
        assert_eq!(qids.len(), 1);
        let qids = fs.walk(1, 3, &["live"]).unwrap();
        assert_eq!(qids.len(), 1);
    }

    #[test]
    fn walk_unknown_synthetic_child_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        assert!(matches!(fs.walk(1, 2, &["nope"]), Err(Error::NotExist)));
    }

    #[test]
    fn dotdot_from_live_root_surfaces_synthetic_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["live"]).unwrap();
        let qids = fs.walk(2, 3, &[".."]).unwrap();
        assert_eq!(qids, vec![synthetic_root_qid()]);
    }

    #[test]
    fn create_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["live"]).unwrap();
        fs.create(2, "hello", 0o644).unwrap();
        fs.open(2, 0).unwrap();
        let n = fs.write(2, 0, b"hello world").unwrap();
        assert_eq!(n as usize, b"hello world".len());
        let mut buf = [0u8; 32];
        let n = fs.read(2, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n as usize], b"hello world");
    }

    #[test]
    fn exclusive_open_rejects_second_opener() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["live"]).unwrap();
        fs.create(2, "locked", 0o644 | DMEXCL).unwrap();
        fs.walk(1, 3, &["live"]).unwrap();
        fs.walk(3, 4, &["locked"]).unwrap();
        assert!(matches!(fs.open(4, 0), Err(Error::AlreadyLocked)));
    }

    #[test]
    fn remove_then_stat_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["live"]).unwrap();
        fs.create(2, "gone", 0o644).unwrap();
        fs.remove(2).unwrap();
        fs.walk(1, 3, &["live"]).unwrap();
        assert!(matches!(fs.walk(3, 4, &["gone"]), Err(Error::NotExist)));
    }

    #[test]
    fn wstat_rejects_gid_change() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["live"]).unwrap();
        fs.create(2, "f", 0o644).unwrap();
        let patch = crate::proto::StatPatch { gid: Some("other".to_string()), ..Default::default() };
        assert!(matches!(fs.wstat(2, &patch), Err(Error::PermissionDenied)));
    }

    #[test]
    fn control_write_flush_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let fs = new_fs(dir.path());
        fs.attach(1);
        fs.walk(1, 2, &["ctl"]).unwrap();
        fs.open(2, 0).unwrap();
        fs.write(2, 0, b"flush\n").unwrap();
        let mut buf = [0u8; 128];
        let n = fs.read(2, 0, &mut buf).unwrap();
        assert!(n > 0);
    }
}
