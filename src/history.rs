//! Read-only history view (spec.md §4.K): a lazily-reloaded list of
//! revisions reachable from `remote_base`, each nameable by a
//! `YYYY-MM-DDTHH-MM` timestamp or by its hex pointer. All mutation
//! attempts against this view return `ReadOnly`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::block::BlockFactory;
use crate::error::{Error, Result};
use crate::pointer::Pointer;
use crate::revision::Revision;
use crate::tree::{Tree, TreeBuilder};
use crate::treestore::{TreeStore, CANONICAL_TAG};

const RELOAD_INTERVAL: Duration = Duration::from_secs(300);
const MAX_ANCESTORS: usize = 10;

pub struct HistoryEntry {
    pub label: String,
    pub revision: Revision,
}

struct State {
    entries: Vec<HistoryEntry>,
    last_reload: Option<Instant>,
}

/// Read-only directory of recent revisions, named `snapshots` at the
/// filesystem surface.
pub struct History {
    store: Arc<TreeStore>,
    factory: Arc<BlockFactory>,
    state: Mutex<State>,
}

impl History {
    pub fn new(store: Arc<TreeStore>, factory: Arc<BlockFactory>) -> History {
        History { store, factory, state: Mutex::new(State { entries: Vec::new(), last_reload: None }) }
    }

    /// Reload if the last reload is missing or stale, then run `f` over
    /// the current entries.
    pub fn with_entries<T>(&self, f: impl FnOnce(&[HistoryEntry]) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        let stale = match state.last_reload {
            Some(t) => t.elapsed() >= RELOAD_INTERVAL,
            None => true,
        };
        if stale {
            let head = self.store.remote_tag(CANONICAL_TAG).unwrap_or(Pointer::NULL);
            let revisions = self.store.history(MAX_ANCESTORS, head, CANONICAL_TAG);
            state.entries = revisions
                .into_iter()
                .map(|revision| HistoryEntry { label: format_timestamp(revision.when), revision })
                .collect();
            state.last_reload = Some(Instant::now());
        }
        f(&state.entries)
    }

    pub fn find_by_label(&self, label: &str) -> Option<Revision> {
        self.with_entries(|entries| entries.iter().find(|e| e.label == label).map(|e| e.revision.clone()))
    }

    pub fn find_by_hex(&self, hex: &str) -> Option<Revision> {
        let pointer: Pointer = hex.parse().ok()?;
        self.store.load_revision(pointer).ok()
    }

    /// Open the read-only subtree rooted at a historical revision.
    pub fn open_subtree(&self, revision_pointer: Pointer) -> Result<Tree> {
        TreeBuilder::new(self.store.clone(), self.factory.clone())
            .with_revision(revision_pointer)
            .build()
    }

    /// Every mutation against the history view is rejected; provided so
    /// callers have one obvious place to route a write-attempted error.
    pub fn reject_write() -> Error {
        Error::ReadOnly
    }
}

/// Format a UTC epoch-seconds timestamp as `YYYY-MM-DDTHH-MM`, by hand
/// (Howard Hinnant's `civil_from_days`) since the crate carries no date
/// library.
fn format_timestamp(epoch_secs: i64) -> String {
    let days = epoch_secs.div_euclid(86_400);
    let secs_of_day = epoch_secs.rem_euclid(86_400);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;

    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}-{minute:02}")
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_zero_formats_as_unix_epoch() {
        assert_eq!(format_timestamp(0), "1970-01-01T00-00");
    }

    #[test]
    fn known_timestamp_formats_correctly() {
        assert_eq!(format_timestamp(1_709_641_200), "2024-03-05T12-20");
    }
}
