//! Disk-backed blob store, sharded by the first two hex characters of the
//! key into subdirectories, with atomic rename-on-write (spec.md §4.A).

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::warn;

use super::{BlobStore, StoreError, StoreResult};

#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<DiskStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DiskStore { root })
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let shard = if key.len() >= 2 { &key[..2] } else { "__" };
        self.root.join(shard)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!(".{key}.tmp"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Visit every key currently stored, in unspecified order.
    pub fn iterate(&self, mut cb: impl FnMut(&str)) -> StoreResult<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        for shard in entries {
            let shard = shard.map_err(StoreError::Io)?;
            if !shard.file_type().map_err(StoreError::Io)?.is_dir() {
                continue;
            }
            let shard_entries = match fs::read_dir(shard.path()) {
                Ok(e) => e,
                Err(e) => return Err(StoreError::Io(e)),
            };
            for file in shard_entries {
                let file = file.map_err(StoreError::Io)?;
                let name = file.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                cb(&name);
            }
        }
        Ok(())
    }
}

impl BlobStore for DiskStore {
    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let dir = self.shard_dir(key);
        fs::create_dir_all(&dir).map_err(StoreError::Io)?;
        let tmp = self.tmp_path_for(key);
        fs::write(&tmp, bytes).map_err(StoreError::Io)?;
        fs::rename(&tmp, self.path_for(key)).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(e)
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => {
                warn!("disk store delete {key}: {e}");
                Err(StoreError::Io(e))
            }
        }
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        self.iterate(|k| keys.push(k.to_string()))?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let key = "ab".to_string() + &"0".repeat(62);
        store.put(&key, b"payload").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"payload");
        store.delete(&key).unwrap();
        assert!(matches!(store.get(&key), Err(StoreError::NotFound)));
    }

    #[test]
    fn shards_by_first_two_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        let key = "cd".to_string() + &"1".repeat(62);
        store.put(&key, b"x").unwrap();
        assert!(dir.path().join("cd").join(&key).exists());
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path()).unwrap();
        assert!(matches!(store.get("deadbeef"), Err(StoreError::NotFound)));
        assert!(matches!(store.delete("deadbeef"), Err(StoreError::NotFound)));
    }
}
