//! In-memory content-addressed DAG: nodes, the arena that owns them, and
//! the tree-level operations (walk/grow/mutate/flush/seal/push/pull)
//! that make up spec.md §4.F.

mod arena;
mod node;
mod ops;

pub use arena::NodeIndex;
pub use node::{ChildEntry, ChildState, Node, DMAPPEND, DMDIR, DMEXCL, MODE_PERM_MASK, UNSUPPORTED_MODE_BITS};
pub use ops::{Tree, TreeBuilder, GROW_PARALLELISM, SNAPSHOT_FREQUENCY, TRIM_QUIESCENCE};
