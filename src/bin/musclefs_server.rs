//! `musclefs-server`: loads `config` from a base directory, builds the
//! mutable working tree, and drives the background loops (J) plus the
//! read-only history view (K). Speaking the on-wire protocol and
//! dispatching requests onto [`musclefs::fs::Filesystem`] is the
//! external dispatcher's job (spec.md §1); this binary exists so the
//! core is reachable and runnable end-to-end without one.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};

use musclefs::fs::Filesystem;
use musclefs::history::History;
use musclefs::tree::TreeBuilder;
use musclefs::{config, setup, snapshot};

#[derive(Parser)]
#[command(name = "musclefs-server", version, about = "Run the musclefs persistence core")]
struct Args {
    /// Directory holding the `config` file and the rest of the persisted
    /// state layout (spec.md §6).
    base_dir: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let cfg = match config::load(&args.base_dir.join("config")) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let stack = match setup::open(&args.base_dir, &cfg) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open store stack: {e}");
            std::process::exit(1);
        }
    };

    let mut builder = TreeBuilder::new(stack.store.clone(), stack.factory.clone()).with_mutable();
    if let Ok(root) = stack.store.local_root_key() {
        builder = builder.with_root(root);
    }
    let tree = match builder.build() {
        Ok(t) => t,
        Err(e) => {
            error!("failed to build working tree: {e}");
            std::process::exit(1);
        }
    };

    let tree = Arc::new(Mutex::new(tree));
    let fs = Arc::new(Filesystem::new(tree.clone(), "muscle".to_string(), "muscle".to_string()));
    let _ = fs; // reachable end-to-end once a dispatcher is attached
    let history = History::new(stack.store.clone(), stack.factory.clone());
    let _ = history;

    let paired = stack.factory.paired().clone();
    let paired_handle = {
        let paired = paired.clone();
        std::thread::spawn(move || paired.run())
    };

    let stop = Arc::new(AtomicBool::new(false));
    let snapshot_handle = {
        let tree = tree.clone();
        let stop = stop.clone();
        std::thread::spawn(move || snapshot::run_snapshot_loop(tree, stop))
    };

    info!("musclefs core running at {}; listening for SIGHUP/SIGINT/SIGTERM", args.base_dir.display());
    snapshot::wait_for_shutdown(tree.clone());

    stop.store(true, std::sync::atomic::Ordering::SeqCst);
    paired.request_stop();
    let _ = snapshot_handle.join();
    let _ = paired_handle.join();
}
