//! Turns a parsed [`Config`] into the store stack the core types need.
//! Shared by both binaries; not part of components A-K, just the wiring
//! an external entry point has to do once.

use std::path::Path;
use std::sync::Arc;

use crate::block::BlockFactory;
use crate::config::{Config, Storage};
use crate::error::{Error, Result};
use crate::store::disk::DiskStore;
use crate::store::http::HttpStore;
use crate::store::null::NullStore;
use crate::store::paired::PairedStore;
use crate::store::BlobStore;
use crate::treestore::TreeStore;

pub struct Stack {
    pub store: Arc<TreeStore>,
    pub factory: Arc<BlockFactory>,
}

/// Open the staging/cache/remote stores named by `cfg` under `base_dir`
/// (the directory the `config` file itself lives in) and wire them into
/// a `TreeStore`/`BlockFactory` pair.
pub fn open(base_dir: &Path, cfg: &Config) -> Result<Stack> {
    std::fs::create_dir_all(base_dir).map_err(|e| Error::store_io("open base_dir", e))?;

    let staging: Arc<dyn BlobStore> = Arc::new(
        DiskStore::new(base_dir.join("staging")).map_err(|e| Error::store_io("open staging", e))?,
    );
    let cache: Arc<dyn BlobStore> = Arc::new(
        DiskStore::new(&cfg.cache_directory).map_err(|e| Error::store_io("open cache", e))?,
    );
    let remote: Arc<dyn BlobStore> = match cfg.storage {
        Storage::Disk => {
            let dir = cfg.disk_store_dir.clone().unwrap_or_else(|| base_dir.join("remote"));
            Arc::new(DiskStore::new(dir).map_err(|e| Error::store_io("open remote disk store", e))?)
        }
        Storage::Null => Arc::new(NullStore),
        Storage::S3 => {
            let endpoint = cfg.s3_options.get("endpoint").cloned().ok_or(Error::InvalidArgument)?;
            Arc::new(HttpStore::new(endpoint))
        }
    };

    let log_path = base_dir.join("propagation.log");
    let paired = Arc::new(
        PairedStore::new(cache.clone(), remote.clone(), &log_path)
            .map_err(|e| Error::store_io("open propagation log", e))?,
    );
    let factory =
        Arc::new(BlockFactory::new(crate::block::DEFAULT_BLOCK_SIZE, cfg.encryption_key.clone(), staging, cache, paired));
    let store = Arc::new(TreeStore::new(base_dir.to_path_buf(), factory.clone(), remote));
    Ok(Stack { store, factory })
}
