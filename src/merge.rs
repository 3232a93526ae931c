//! Three-way merge between a local tree, its last-known-common base, and
//! a remote tree (spec.md §4.G). Produces a line-oriented worklog a
//! caller can execute mechanically; unresolvable conflicts are emitted
//! as `#`-prefixed comment hints instead of a command.
//!
//! Equality between two nodes is judged by sealed pointer only (for
//! directories) or by their ordered block-reference sequence (for
//! files) — not by reading and comparing plaintext. A node that was
//! never re-sealed keeps its original pointer, so this is exact for
//! anything the merge actually needs to decide.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::tree::{ChildState, NodeIndex, Tree};

fn child_map(tree: &mut Tree, dir: NodeIndex) -> Result<HashMap<String, NodeIndex>> {
    tree.grow(dir)?;
    let node = tree.get(dir)?;
    let mut map = HashMap::with_capacity(node.children.len());
    for child in &node.children {
        if let ChildState::Loaded(idx) = child.state {
            let name = tree.get(idx)?.name.clone();
            map.insert(name, idx);
        }
    }
    Ok(map)
}

fn nodes_equal(a_tree: &Tree, a: NodeIndex, b_tree: &Tree, b: NodeIndex) -> Result<bool> {
    let an = a_tree.get(a)?;
    let bn = b_tree.get(b)?;
    if an.is_dir() != bn.is_dir() {
        return Ok(false);
    }
    if an.is_dir() {
        Ok(!an.pointer.is_null() && an.pointer == bn.pointer)
    } else {
        let a_refs: Vec<_> = an.blocks.iter().map(|blk| blk.reference()).collect();
        let b_refs: Vec<_> = bn.blocks.iter().map(|blk| blk.reference()).collect();
        Ok(a_refs == b_refs && an.size == bn.size)
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Build the pull worklog for `local` against `base`/`remote`, appending
/// lines to `out`. Recurses into directories that both sides touched so
/// conflicts are localized to the smallest affected path.
#[allow(clippy::too_many_arguments)]
fn diff_dir(
    local: &mut Tree,
    local_dir: NodeIndex,
    base: &mut Tree,
    base_dir: NodeIndex,
    remote: &mut Tree,
    remote_dir: NodeIndex,
    prefix: &str,
    ignored: &HashMap<String, HashSet<String>>,
    remote_base_hex: &str,
    out: &mut Vec<String>,
    changed: &mut bool,
) -> Result<()> {
    let local_map = child_map(local, local_dir)?;
    let base_map = child_map(base, base_dir)?;
    let remote_map = child_map(remote, remote_dir)?;

    let mut names: Vec<&String> = local_map.keys().chain(base_map.keys()).chain(remote_map.keys()).collect();
    names.sort();
    names.dedup();

    let ignored_here: Option<&HashSet<String>> = ignored.get(remote_base_hex);

    for name in names {
        let path = join(prefix, name);
        if ignored_here.map(|set| set.contains(&path)).unwrap_or(false) {
            continue;
        }

        let local_idx = local_map.get(name).copied();
        let base_idx = base_map.get(name).copied();
        let remote_idx = remote_map.get(name).copied();

        match (local_idx, base_idx, remote_idx) {
            (_, None, None) => {
                // Only ever existed locally; nothing to merge.
            }
            (local_idx, Some(b), None) => {
                // Remote deleted it.
                let local_unchanged = match local_idx {
                    Some(l) => nodes_equal(local, l, base, b)?,
                    None => true,
                };
                if local_unchanged {
                    if local_idx.is_some() {
                        out.push(format!("unlink {path}"));
                        *changed = true;
                    }
                } else {
                    out.push(format!("# conflict {path}: remote deleted, local modified"));
                }
            }
            (None, None, Some(_)) => {
                out.push(format!("graft2 {remote_base_hex}/{path} {path}"));
                *changed = true;
            }
            (Some(l), None, Some(r)) => {
                if nodes_equal(local, l, remote, r)? {
                    // Both sides added the same thing independently.
                } else {
                    out.push(format!("# conflict {path}: both added, differ"));
                }
            }
            (local_idx, Some(b), Some(r)) => {
                let remote_changed = !nodes_equal(remote, r, base, b)?;
                if !remote_changed {
                    continue;
                }
                let local_changed = match local_idx {
                    Some(l) => !nodes_equal(local, l, base, b)?,
                    None => true,
                };
                if !local_changed {
                    out.push(format!("graft2 {remote_base_hex}/{path} {path}"));
                    *changed = true;
                    continue;
                }
                if let Some(l) = local_idx {
                    if nodes_equal(local, l, remote, r)? {
                        continue;
                    }
                    let both_dirs = local.get(l)?.is_dir() && remote.get(r)?.is_dir() && base.get(b)?.is_dir();
                    if both_dirs {
                        diff_dir(
                            local,
                            l,
                            base,
                            b,
                            remote,
                            r,
                            &path,
                            ignored,
                            remote_base_hex,
                            out,
                            changed,
                        )?;
                        continue;
                    }
                }
                out.push(format!("# conflict {path}: local and remote both changed"));
            }
        }
    }
    Ok(())
}

/// Compute (and, via the caller's `apply_worklog`, mechanically execute)
/// the worklog to reconcile `local` with `remote`, given their common
/// ancestor `base`. A trailing `flush` line is appended whenever any
/// mutating command was emitted.
pub fn pull_worklog(
    local: &mut Tree,
    base: &mut Tree,
    remote: &mut Tree,
    ignored: &HashMap<String, HashSet<String>>,
    remote_base_hex: &str,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut changed = false;
    diff_dir(
        local,
        local.root(),
        base,
        base.root(),
        remote,
        remote.root(),
        "",
        ignored,
        remote_base_hex,
        &mut lines,
        &mut changed,
    )?;
    if changed {
        lines.push("flush".to_string());
    }
    Ok(lines)
}
