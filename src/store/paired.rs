//! Write-back cache from a fast local store to a slow remote store, backed
//! by a durable, crash-safe propagation log (spec.md §4.B, §5).
//!
//! `put` writes through to the fast store synchronously and appends a
//! pending line to the log; a background consumer drains pending lines in
//! order, copies bytes from fast to slow, and marks each line done (`d`)
//! or missing (`m`). Up to 16 uploads proceed in parallel. On restart the
//! log is compacted: done lines are dropped, everything else is kept in
//! its relative order.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use super::{BlobStore, StoreError, StoreResult};
use crate::concurrency::Semaphore;

const KEY_LEN: usize = 64;
const LINE_LEN: usize = 1 + KEY_LEN + 1;
const MAX_PARALLEL_UPLOADS: usize = 16;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Pending,
    Done,
    Missing,
}

impl LineState {
    fn byte(self) -> u8 {
        match self {
            LineState::Pending => b'p',
            LineState::Done => b'd',
            LineState::Missing => b'm',
        }
    }

    fn from_byte(b: u8) -> Option<LineState> {
        match b {
            b'p' => Some(LineState::Pending),
            b'd' => Some(LineState::Done),
            b'm' => Some(LineState::Missing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    offset: u64,
    key: String,
    state: LineState,
}

fn line_bytes(state: LineState, key: &str) -> io::Result<[u8; LINE_LEN]> {
    if key.len() != KEY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "propagation log key must be 64 hex characters",
        ));
    }
    let mut buf = [0u8; LINE_LEN];
    buf[0] = state.byte();
    buf[1..1 + KEY_LEN].copy_from_slice(key.as_bytes());
    buf[LINE_LEN - 1] = b'\n';
    Ok(buf)
}

/// The durable FIFO of pending fast-to-slow propagations.
pub struct PropagationLog {
    file: Mutex<File>,
}

impl PropagationLog {
    /// Open (creating if absent) and compact: drop done lines, keep the
    /// rest in their relative order (spec.md §5).
    pub fn open(path: &Path) -> io::Result<PropagationLog> {
        let existing = Self::read_all(path)?;
        let surviving: Vec<&LogEntry> = existing
            .iter()
            .filter(|e| e.state != LineState::Done)
            .collect();

        let mut buf = Vec::with_capacity(surviving.len() * LINE_LEN);
        for e in &surviving {
            buf.extend_from_slice(&line_bytes(e.state, &e.key)?);
        }
        let tmp = path.with_extension("compact.tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, path)?;

        if existing.len() != surviving.len() {
            info!(
                "propagation log compacted: {} done lines dropped, {} remain",
                existing.len() - surviving.len(),
                surviving.len()
            );
        }

        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Ok(PropagationLog { file: Mutex::new(file) })
    }

    fn read_all(path: &Path) -> io::Result<Vec<LogEntry>> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        let mut offset = 0u64;
        for chunk in bytes.chunks(LINE_LEN) {
            if chunk.len() != LINE_LEN || chunk[LINE_LEN - 1] != b'\n' {
                break;
            }
            let Some(state) = LineState::from_byte(chunk[0]) else {
                break;
            };
            let key = String::from_utf8_lossy(&chunk[1..1 + KEY_LEN]).to_string();
            entries.push(LogEntry { offset, key, state });
            offset += LINE_LEN as u64;
        }
        Ok(entries)
    }

    fn pending_in_order(&self) -> io::Result<Vec<LogEntry>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut entries = Vec::new();
        let mut offset = 0u64;
        for chunk in bytes.chunks(LINE_LEN) {
            if chunk.len() == LINE_LEN && chunk[LINE_LEN - 1] == b'\n' {
                if let Some(LineState::Pending) = LineState::from_byte(chunk[0]) {
                    let key = String::from_utf8_lossy(&chunk[1..1 + KEY_LEN]).to_string();
                    entries.push(LogEntry { offset, key, state: LineState::Pending });
                }
            }
            offset += LINE_LEN as u64;
        }
        Ok(entries)
    }

    fn append(&self, key: &str) -> io::Result<u64> {
        let line = line_bytes(LineState::Pending, key)?;
        let mut file = self.file.lock().unwrap();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(offset)
    }

    fn mark(&self, offset: u64, state: LineState) -> io::Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[state.byte()])?;
        file.flush()
    }
}

/// Write-back pairing of a fast and a slow `BlobStore`.
pub struct PairedStore {
    fast: Arc<dyn BlobStore>,
    slow: Arc<dyn BlobStore>,
    log: PropagationLog,
    wake: Condvar,
    woken: Mutex<bool>,
    stop: AtomicBool,
}

impl PairedStore {
    pub fn new(
        fast: Arc<dyn BlobStore>,
        slow: Arc<dyn BlobStore>,
        log_path: &Path,
    ) -> io::Result<PairedStore> {
        Ok(PairedStore {
            fast,
            slow,
            log: PropagationLog::open(log_path)?,
            wake: Condvar::new(),
            woken: Mutex::new(false),
            stop: AtomicBool::new(false),
        })
    }

    /// Write through to the fast store and enqueue for propagation.
    pub fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        self.fast.put(key, bytes)?;
        self.log.append(key).map_err(StoreError::Io)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        match self.fast.get(key) {
            Ok(bytes) => Ok(bytes),
            Err(StoreError::NotFound) => self.slow.get(key),
            Err(e) => Err(e),
        }
    }

    /// Wake the background loop immediately instead of waiting for the
    /// next poll — called after `push` so the new revision starts
    /// uploading right away.
    pub fn notify(&self) {
        *self.woken.lock().unwrap() = true;
        self.wake.notify_all();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify();
    }

    /// Run the propagation consumer loop until `request_stop` is called.
    /// Intended to run on its own background thread.
    pub fn run(&self) {
        while !self.stop.load(Ordering::SeqCst) {
            let entries = match self.log.pending_in_order() {
                Ok(e) => e,
                Err(e) => {
                    warn!("propagation log read failed: {e}");
                    Vec::new()
                }
            };
            if entries.is_empty() {
                let guard = self.woken.lock().unwrap();
                let (mut guard, _) = self
                    .wake
                    .wait_timeout(guard, RETRY_BACKOFF)
                    .unwrap();
                *guard = false;
                continue;
            }
            let sem = Semaphore::new(MAX_PARALLEL_UPLOADS);
            thread::scope(|scope| {
                for entry in entries {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let permit = sem.acquire();
                    scope.spawn(move || {
                        self.process_entry(&entry);
                        drop(permit);
                    });
                }
            });
        }
    }

    /// Process every currently-pending entry once, in parallel, and
    /// return without waiting for more to arrive. Used by `musclesctl
    /// upload` to flush the queue outside of the long-running server.
    pub fn drain_once(&self) {
        let entries = match self.log.pending_in_order() {
            Ok(e) => e,
            Err(e) => {
                warn!("propagation log read failed: {e}");
                return;
            }
        };
        let sem = Semaphore::new(MAX_PARALLEL_UPLOADS);
        thread::scope(|scope| {
            for entry in entries {
                let permit = sem.acquire();
                scope.spawn(move || {
                    self.process_entry(&entry);
                    drop(permit);
                });
            }
        });
    }

    fn process_entry(&self, entry: &LogEntry) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match self.fast.get(&entry.key) {
                Ok(bytes) => match self.slow.put(&entry.key, &bytes) {
                    Ok(()) => {
                        if let Err(e) = self.log.mark(entry.offset, LineState::Done) {
                            warn!("propagation log mark done failed for {}: {e}", entry.key);
                        }
                        return;
                    }
                    Err(e) => {
                        warn!("propagation upload failed for {}: {e}, retrying", entry.key);
                        thread::sleep(RETRY_BACKOFF);
                    }
                },
                Err(StoreError::NotFound) => {
                    warn!("propagation source missing for {}", entry.key);
                    if let Err(e) = self.log.mark(entry.offset, LineState::Missing) {
                        warn!("propagation log mark missing failed for {}: {e}", entry.key);
                    }
                    return;
                }
                Err(e) => {
                    warn!("propagation fast-store read failed for {}: {e}, retrying", entry.key);
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
}

impl std::fmt::Debug for PairedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedStore").finish_non_exhaustive()
    }
}

/// Path of the propagation log under a base directory (spec.md §6).
pub fn default_log_path(base_dir: &Path) -> PathBuf {
    base_dir.join("propagation.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::disk::DiskStore;

    fn key(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn put_then_drain_reaches_slow_store() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(DiskStore::new(dir.path().join("fast")).unwrap());
        let slow = Arc::new(DiskStore::new(dir.path().join("slow")).unwrap());
        let log_path = dir.path().join("propagation.log");
        let paired = Arc::new(PairedStore::new(fast, slow.clone(), &log_path).unwrap());

        let k = key(1);
        paired.put(&k, b"payload").unwrap();

        let runner = paired.clone();
        let handle = thread::spawn(move || runner.run());
        // give the loop a moment, then request shutdown
        for _ in 0..200 {
            if slow.get(&k).is_ok() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        paired.request_stop();
        handle.join().unwrap();

        assert_eq!(slow.get(&k).unwrap(), b"payload");
    }

    #[test]
    fn restart_compacts_done_lines_and_keeps_pending() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("propagation.log");
        {
            let log = PropagationLog::open(&log_path).unwrap();
            let o1 = log.append(&key(1)).unwrap();
            log.append(&key(2)).unwrap();
            log.mark(o1, LineState::Done).unwrap();
        }
        // restart: compaction should drop the done line for key(1)
        let log = PropagationLog::open(&log_path).unwrap();
        let pending = log.pending_in_order().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, key(2));
    }

    #[test]
    fn crash_after_k5_done_k6_pending_resumes_from_k6() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(DiskStore::new(dir.path().join("fast")).unwrap());
        let slow = Arc::new(DiskStore::new(dir.path().join("slow")).unwrap());
        let log_path = dir.path().join("propagation.log");
        let keys: Vec<String> = (1..=10u8).map(key).collect();

        {
            let log = PropagationLog::open(&log_path).unwrap();
            let mut offsets = Vec::new();
            for k in &keys {
                fast.put(k, k.as_bytes()).unwrap();
                offsets.push(log.append(k).unwrap());
            }
            // K1..K5 finished (line `d`) before the crash; K6's upload was
            // in flight (line stays `p`), K7..K10 never started.
            for &offset in &offsets[..5] {
                log.mark(offset, LineState::Done).unwrap();
            }
            for k in &keys[..5] {
                slow.put(k, k.as_bytes()).unwrap();
            }
        }

        // restart: compaction drops K1..K5, K6..K10 survive as pending
        let log = PropagationLog::open(&log_path).unwrap();
        let pending = log.pending_in_order().unwrap();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending.iter().map(|e| e.key.clone()).collect::<Vec<_>>(), keys[5..]);

        let paired = PairedStore::new(fast, slow.clone(), &log_path).unwrap();
        paired.drain_once();
        for k in &keys {
            assert_eq!(slow.get(k).unwrap(), k.as_bytes());
        }
    }

    #[test]
    fn missing_source_is_marked_and_not_retried_forever() {
        let dir = tempfile::tempdir().unwrap();
        let fast = Arc::new(DiskStore::new(dir.path().join("fast")).unwrap());
        let slow = Arc::new(DiskStore::new(dir.path().join("slow")).unwrap());
        let log_path = dir.path().join("propagation.log");
        let paired = PairedStore::new(fast.clone(), slow, &log_path).unwrap();
        let k = key(3);
        let offset = paired.log.append(&k).unwrap();
        fast.delete(&k).ok();
        paired.process_entry(&LogEntry { offset, key: k, state: LineState::Pending });
        let pending = paired.log.pending_in_order().unwrap();
        assert!(pending.is_empty());
    }
}
