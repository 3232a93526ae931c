//! End-to-end scenarios driven entirely through the public API: the fid
//! request layer for single-machine behavior, and raw `Tree` push/pull
//! for the two-machine case.

use std::sync::{Arc, Mutex};

use musclefs::block::BlockFactory;
use musclefs::crypto::TreeKey;
use musclefs::error::Error;
use musclefs::fs::Filesystem;
use musclefs::proto::StatPatch;
use musclefs::store::disk::DiskStore;
use musclefs::store::paired::PairedStore;
use musclefs::tree::{TreeBuilder, DMDIR, DMEXCL};
use musclefs::treestore::{TreeStore, CANONICAL_TAG};

fn new_fs(tmp: &std::path::Path, key_byte: u8) -> Filesystem {
    let staging = Arc::new(DiskStore::new(tmp.join("staging")).unwrap());
    let cache = Arc::new(DiskStore::new(tmp.join("cache")).unwrap());
    let remote = Arc::new(DiskStore::new(tmp.join("remote")).unwrap());
    let paired = Arc::new(PairedStore::new(cache.clone(), remote.clone(), &tmp.join("propagation.log")).unwrap());
    let factory = Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([key_byte; 32]), staging, cache, paired));
    let store = Arc::new(TreeStore::new(tmp.to_path_buf(), factory.clone(), remote));
    let tree = TreeBuilder::new(store, factory).with_mutable().build().unwrap();
    Filesystem::new(Arc::new(Mutex::new(tree)), "muscle".to_string(), "muscle".to_string())
}

#[test]
fn directory_mtime_bumps_on_create_and_remove_but_not_otherwise() {
    let dir = tempfile::tempdir().unwrap();
    let fs = new_fs(dir.path(), 10);
    fs.attach(1);

    fs.walk(1, 2, &["live"]).unwrap();
    fs.create(2, "d", DMDIR | 0o755).unwrap(); // fid 2 now refers to "d"
    fs.wstat(2, &StatPatch { mtime: Some(0), ..Default::default() }).unwrap();
    assert_eq!(fs.stat(2).unwrap().mtime, 0);

    fs.walk(1, 3, &["live", "d"]).unwrap();
    fs.create(3, "f", 0o644).unwrap(); // bumps d's mtime via the parent-chain update in add()
    assert!(fs.stat(2).unwrap().mtime > 0, "creating a child must bump the parent's mtime");

    fs.wstat(2, &StatPatch { mtime: Some(0), ..Default::default() }).unwrap();
    assert_eq!(fs.stat(2).unwrap().mtime, 0);

    fs.remove(3).unwrap(); // "f" is gone; d's mtime bumps again via unlink()
    assert!(fs.stat(2).unwrap().mtime > 0, "removing a child must bump the parent's mtime");
}

#[test]
fn rename_via_control_file_moves_subtree_and_old_path_vanishes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = new_fs(dir.path(), 11);
    fs.attach(1);

    fs.walk(1, 2, &["live"]).unwrap();
    fs.create(2, "a", DMDIR | 0o755).unwrap(); // fid 2 -> "a"
    fs.create(2, "x", 0o644).unwrap(); // fid 2 -> "a/x"
    fs.open(2, 0).unwrap();
    fs.write(2, 0, b"hello world").unwrap();

    fs.walk(1, 3, &["live"]).unwrap();
    fs.create(3, "b", DMDIR | 0o755).unwrap();

    fs.walk(1, 4, &["ctl"]).unwrap();
    fs.open(4, 0).unwrap();
    fs.write(4, 0, b"rename a b/new\n").unwrap();

    fs.walk(1, 5, &["live"]).unwrap();
    assert!(matches!(fs.walk(5, 6, &["a"]), Err(Error::NotExist)));

    fs.walk(1, 7, &["live"]).unwrap();
    let qids = fs.walk(7, 8, &["b", "new", "x"]).unwrap();
    assert_eq!(qids.len(), 3);
    fs.open(8, 0).unwrap();
    let mut buf = [0u8; 32];
    let n = fs.read(8, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n as usize], b"hello world");
}

#[test]
fn exclusive_open_blocks_until_wstat_clears_dmexcl() {
    let dir = tempfile::tempdir().unwrap();
    let fs = new_fs(dir.path(), 12);
    fs.attach(1);

    fs.walk(1, 2, &["live"]).unwrap();
    fs.create(2, "locked", 0o644 | DMEXCL).unwrap(); // create()'s own DMEXCL branch is the "open"

    fs.walk(1, 3, &["live"]).unwrap();
    fs.walk(3, 4, &["locked"]).unwrap();
    assert!(matches!(fs.open(4, 0), Err(Error::AlreadyLocked)));

    fs.wstat(2, &StatPatch { mode: Some(0o644), ..Default::default() }).unwrap();

    fs.open(4, 0).unwrap();
}

#[test]
fn push_requires_fresh_base_and_pull_resyncs_before_retry() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(DiskStore::new(dir.path().join("shared-remote")).unwrap());

    // One initial sync establishes a common base both machines start from.
    let origin_staging = Arc::new(DiskStore::new(dir.path().join("origin/staging")).unwrap());
    let origin_cache = Arc::new(DiskStore::new(dir.path().join("origin/cache")).unwrap());
    let origin_paired = Arc::new(
        PairedStore::new(origin_cache.clone(), remote.clone(), &dir.path().join("origin/propagation.log")).unwrap(),
    );
    let origin_factory =
        Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([20u8; 32]), origin_staging, origin_cache, origin_paired));
    let origin_store = Arc::new(TreeStore::new(dir.path().join("origin"), origin_factory.clone(), remote.clone()));
    let mut origin_tree = TreeBuilder::new(origin_store.clone(), origin_factory.clone()).with_mutable().build().unwrap();
    let root = origin_tree.root();
    let shared = origin_tree.add(root, "shared.txt", 0o644).unwrap();
    origin_tree.write_at(shared, b"common ancestor", 0).unwrap();
    let r0 = origin_tree.push(&[]).unwrap();
    origin_factory.paired().drain_once();

    // Machine A "clones" at r0 and pushes a change.
    let a_staging = Arc::new(DiskStore::new(dir.path().join("a/staging")).unwrap());
    let a_cache = Arc::new(DiskStore::new(dir.path().join("a/cache")).unwrap());
    let a_paired =
        Arc::new(PairedStore::new(a_cache.clone(), remote.clone(), &dir.path().join("a/propagation.log")).unwrap());
    let a_factory = Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([20u8; 32]), a_staging, a_cache, a_paired));
    let a_store = Arc::new(TreeStore::new(dir.path().join("a"), a_factory.clone(), remote.clone()));
    a_store.set_local_base_pointer(r0.pointer).unwrap();
    let mut a_tree = TreeBuilder::new(a_store.clone(), a_factory.clone())
        .with_root(r0.root_key)
        .with_mutable()
        .build()
        .unwrap();
    let a_root = a_tree.root();
    let from_a = a_tree.add(a_root, "from-a.txt", 0o644).unwrap();
    a_tree.write_at(from_a, b"change from a", 0).unwrap();
    let r1 = a_tree.push(&[]).unwrap();
    a_factory.paired().drain_once();
    assert_eq!(a_store.local_base_pointer().unwrap(), r1.pointer);
    assert_eq!(origin_store.remote_tag(CANONICAL_TAG).unwrap(), r1.pointer);

    // Machine B also "cloned" at r0, makes an independent change, and
    // tries to push without having learned about r1 yet.
    let b_staging = Arc::new(DiskStore::new(dir.path().join("b/staging")).unwrap());
    let b_cache = Arc::new(DiskStore::new(dir.path().join("b/cache")).unwrap());
    let b_paired =
        Arc::new(PairedStore::new(b_cache.clone(), remote.clone(), &dir.path().join("b/propagation.log")).unwrap());
    let b_factory = Arc::new(BlockFactory::new(4096, TreeKey::from_bytes([20u8; 32]), b_staging, b_cache, b_paired));
    let b_store = Arc::new(TreeStore::new(dir.path().join("b"), b_factory.clone(), remote.clone()));
    b_store.set_local_base_pointer(r0.pointer).unwrap();
    let mut b_tree = TreeBuilder::new(b_store.clone(), b_factory.clone())
        .with_root(r0.root_key)
        .with_mutable()
        .build()
        .unwrap();
    let b_root = b_tree.root();
    let from_b = b_tree.add(b_root, "from-b.txt", 0o644).unwrap();
    b_tree.write_at(from_b, b"change from b", 0).unwrap();

    assert!(matches!(b_tree.push(&[]), Err(Error::Busy)));

    let worklog = b_tree.pull().unwrap();
    assert!(!worklog.is_empty(), "pull must report work bringing in a's change");
    assert_eq!(b_store.local_base_pointer().unwrap(), r1.pointer);

    // graft2 pulled a's file in; b's own new file is untouched; a second
    // pull is a no-op now that both bases agree.
    let b_root2 = b_tree.root();
    assert!(b_tree.walk(b_root2, &["from-a.txt"]).is_ok());
    assert!(b_tree.walk(b_root2, &["from-b.txt"]).is_ok());
    assert_eq!(b_tree.pull().unwrap(), "");

    let r2 = b_tree.push(&[]).unwrap();
    assert_eq!(b_store.local_base_pointer().unwrap(), r2.pointer);
    assert_eq!(origin_store.remote_tag(CANONICAL_TAG).unwrap(), r2.pointer);
}
