//! Generational slab of nodes (spec.md §9: "an arena-and-index layout is
//! a natural fit"). Indices stay valid across `Tree` mutations; trimming a
//! node frees its slot for reuse and bumps the slot's generation so stale
//! indices are detected rather than silently aliasing a new node.

use super::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex {
    slot: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl Arena {
    pub fn new() -> Arena {
        Arena { slots: Vec::new(), free: Vec::new() }
    }

    pub fn insert(&mut self, node: Node) -> NodeIndex {
        if let Some(slot_idx) = self.free.pop() {
            let slot = &mut self.slots[slot_idx];
            slot.node = Some(node);
            NodeIndex { slot: slot_idx, generation: slot.generation }
        } else {
            let generation = 0;
            self.slots.push(Slot { generation, node: Some(node) });
            NodeIndex { slot: self.slots.len() - 1, generation }
        }
    }

    pub fn get(&self, idx: NodeIndex) -> Option<&Node> {
        self.slots
            .get(idx.slot)
            .filter(|s| s.generation == idx.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, idx: NodeIndex) -> Option<&mut Node> {
        self.slots
            .get_mut(idx.slot)
            .filter(|s| s.generation == idx.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Remove the node at `idx`, freeing the slot for reuse under a new
    /// generation. Any `NodeIndex` still pointing at the old generation
    /// becomes a stale reference that `get`/`get_mut` reject.
    pub fn remove(&mut self, idx: NodeIndex) -> Option<Node> {
        let slot = self.slots.get_mut(idx.slot)?;
        if slot.generation != idx.generation {
            return None;
        }
        let node = slot.node.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx.slot);
        node
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.slots.iter().enumerate().filter_map(|(slot, s)| {
            s.node.as_ref().map(|n| (NodeIndex { slot, generation: s.generation }, n))
        })
    }
}
