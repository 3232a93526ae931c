//! Background snapshot loop and signal-driven graceful shutdown
//! (spec.md §4.J).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::tree::Tree;

const SLEEP_INTERVAL: Duration = Duration::from_secs(180);

/// Runs on its own thread: periodically takes the tree mutex and flushes
/// if due, until `stop` is set.
pub fn run_snapshot_loop(tree: Arc<Mutex<Tree>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(SLEEP_INTERVAL);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut guard = tree.lock().unwrap();
        match guard.flush_if_not_done_recently() {
            Ok(Some(pointer)) => {
                if let Err(e) = guard.store().set_local_root_key(pointer) {
                    warn!("failed to persist local root pointer: {e}");
                }
                info!("periodic flush stored root {pointer}");
            }
            Ok(None) => {}
            Err(e) => warn!("periodic flush failed: {e}"),
        }
    }
}

/// Blocks the calling thread, waiting for SIGHUP/SIGINT/SIGTERM. On each
/// signal, takes the tree mutex and performs a final flush; only returns
/// (allowing the process to exit) once a flush succeeds.
pub fn wait_for_shutdown(tree: Arc<Mutex<Tree>>) {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM]).expect("failed to install signal handlers");
    for signal in signals.forever() {
        info!("received signal {signal}, attempting final flush");
        let mut guard = tree.lock().unwrap();
        match guard.flush() {
            Ok(pointer) => {
                if let Err(e) = guard.store().set_local_root_key(pointer) {
                    warn!("failed to persist local root pointer: {e}");
                }
                info!("final flush stored root {pointer}, exiting");
                return;
            }
            Err(e) => {
                error!("final flush failed: {e}; waiting for another signal to retry");
            }
        }
    }
}
