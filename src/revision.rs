//! Immutable snapshot of a tree, analogous to a commit (spec.md §3).

use crate::codec::{RevisionRecord, BASE_TAG};
use crate::pointer::Pointer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub pointer: Pointer,
    pub root_key: Pointer,
    pub parents: Vec<(String, Pointer)>,
    pub host: String,
    pub when: i64,
}

impl Revision {
    pub fn new(root_key: Pointer, parents: Vec<(String, Pointer)>, host: String, when: i64) -> Revision {
        Revision { pointer: Pointer::NULL, root_key, parents, host, when }
    }

    pub fn base(&self) -> Option<Pointer> {
        self.parents
            .iter()
            .find(|(name, _)| name == BASE_TAG)
            .map(|(_, p)| *p)
    }

    pub fn to_record(&self) -> RevisionRecord {
        RevisionRecord {
            root: self.root_key,
            parents: self.parents.clone(),
            when: self.when,
            host: self.host.clone(),
        }
    }

    pub fn from_record(pointer: Pointer, record: RevisionRecord) -> Revision {
        Revision {
            pointer,
            root_key: record.root,
            parents: record.parents,
            host: record.host,
            when: record.when,
        }
    }
}
