//! Control file (spec.md §4.I, §6): accepts one command per write,
//! appends its textual result to a running output buffer that reads
//! return like an ordinary file.

use std::str::FromStr;

use log::info;

use crate::error::{Error, Result};
use crate::tree::Tree;

/// Backs the `muscle/ctl` file. One instance per open fid, per spec's
/// "maintains a running output buffer" wording — each open gets its own
/// conversation with the tree.
#[derive(Default)]
pub struct ControlFile {
    buffer: Vec<u8>,
}

impl ControlFile {
    pub fn new() -> ControlFile {
        ControlFile::default()
    }

    fn append(&mut self, text: &str) {
        self.buffer.extend_from_slice(text.as_bytes());
        if !text.ends_with('\n') {
            self.buffer.push(b'\n');
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> u32 {
        let start = offset as usize;
        if start >= self.buffer.len() {
            return 0;
        }
        let end = (start + buf.len()).min(self.buffer.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.buffer[start..end]);
        n as u32
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Dispatch one line of input. Each recognized command is described
    /// in spec.md §4.F/§4.G/§4.E; unrecognized commands are an error.
    pub fn write(&mut self, tree: &mut Tree, line: &str) -> Result<()> {
        let line = line.trim_end_matches('\n');
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match cmd {
            "diff" => {
                let out = tree.diff()?;
                self.append(&out);
            }
            "lsof" => {
                for path in tree.list_nodes_in_use() {
                    self.append(&path);
                }
            }
            "dump" => {
                self.append(&format!("root revision {}", tree.revision()));
                for path in tree.list_nodes_in_use() {
                    self.append(&format!("in-use {path}"));
                }
            }
            "keep-local-for" => {
                let (rev, path) = rest.split_once('/').ok_or(Error::InvalidArgument)?;
                tree.ignore(rev, path);
            }
            "rename" => {
                let (src, dst) = rest.split_once(' ').ok_or(Error::InvalidArgument)?;
                tree.rename_path(src, dst)?;
            }
            "unlink" => {
                if rest.is_empty() {
                    return Err(Error::InvalidArgument);
                }
                let idx = tree.walk_path(rest)?;
                tree.unlink(idx)?;
            }
            "graft2" => {
                tree.apply_graft2(rest)?;
            }
            "graft" => {
                let (src, dst) = rest.split_once(' ').ok_or(Error::InvalidArgument)?;
                let (rev, sub_path) = src.split_once('/').unwrap_or((src, ""));
                tree.graft_from_revision(rev, sub_path, dst)?;
            }
            "trim" => {
                tree.trim();
            }
            "flush" => {
                let pointer = tree.flush()?;
                tree.store().set_local_root_key(pointer)?;
                self.append(&pointer.to_hex());
            }
            "pull" => {
                let out = tree.pull()?;
                self.append(&out);
            }
            "push" => {
                let tags: Vec<&str> = rest.split_whitespace().collect();
                let revision = tree.push(&tags)?;
                self.append(&revision.pointer.to_hex());
            }
            "level" => {
                let level = log::LevelFilter::from_str(rest).map_err(|_| Error::InvalidArgument)?;
                log::set_max_level(level);
                info!("log level set to {level}");
            }
            _ => return Err(Error::InvalidArgument),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockFactory;
    use crate::crypto::TreeKey;
    use crate::store::disk::DiskStore;
    use crate::store::paired::PairedStore;
    use crate::tree::TreeBuilder;
    use std::sync::Arc;

    fn new_tree(tmp: &std::path::Path) -> Tree {
        let staging = Arc::new(DiskStore::new(tmp.join("staging")).unwrap());
        let cache = Arc::new(DiskStore::new(tmp.join("cache")).unwrap());
        let remote = Arc::new(DiskStore::new(tmp.join("remote")).unwrap());
        let paired = Arc::new(PairedStore::new(cache.clone(), remote.clone(), &tmp.join("propagation.log")).unwrap());
        let factory = Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([1u8; 32]), staging, cache, paired));
        let store = Arc::new(crate::treestore::TreeStore::new(tmp.to_path_buf(), factory.clone(), remote));
        TreeBuilder::new(store, factory).with_mutable().build().unwrap()
    }

    #[test]
    fn flush_command_appends_pointer_hex() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let mut ctl = ControlFile::new();
        ctl.write(&mut tree, "flush").unwrap();
        assert!(ctl.len() > 0);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let mut ctl = ControlFile::new();
        assert!(matches!(ctl.write(&mut tree, "bogus"), Err(Error::InvalidArgument)));
    }

    #[test]
    fn rename_via_control_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = new_tree(dir.path());
        let root = tree.root();
        let a = tree.add(root, "a", 0o755 | crate::tree::DMDIR).unwrap();
        tree.add(a, "x", 0o644).unwrap();
        tree.add(root, "b", 0o755 | crate::tree::DMDIR).unwrap();
        let mut ctl = ControlFile::new();
        ctl.write(&mut tree, "rename a/x b/x").unwrap();
        assert!(matches!(tree.walk(root, &["a", "x"]), Err(Error::NotExist)));
        assert!(tree.walk(root, &["b", "x"]).is_ok());
    }
}
