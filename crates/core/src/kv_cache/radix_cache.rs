use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::token_pool::SlotId;

/// Identifier of a node in the radix tree arena.
pub type NodeId = usize;

/// Radix tree over token-id sequences for KV cache slot reuse.
///
/// When multiple requests share a common token prefix, the cache slots
/// holding that prefix's KV data can be reused instead of recomputed. Each
/// edge of the tree is labeled by a token subsequence and carries the slot
/// ids for exactly those positions, so a longest-prefix match yields both
/// the number of reusable tokens and the physical slots holding them.
///
/// Nodes carry a lock reference count: while a request is running on top of
/// a matched prefix, the path from its boundary node up to the root is
/// locked and cannot be evicted. Unlocked subtrees are reclaimed leaf-first
/// in least-recently-matched order when the pool runs out of free slots.
///
/// The tree never owns more than one pool reference per slot: inserting a
/// sequence whose prefix is already cached keeps the existing slot ids and
/// reports the overlap so the caller can release its duplicates.
pub struct RadixCache {
    /// Arena storage; freed entries are tombstoned and recycled.
    nodes: Vec<Node>,
    free_nodes: Vec<NodeId>,
    /// Monotonic counter stamped onto nodes as they are visited.
    tick: u64,
    /// Total slots held by unlocked nodes (reclaimable via `evict`).
    evictable_size: usize,
}

struct Node {
    /// Edge label: the tokens covered between the parent and this node.
    key: Vec<u32>,
    /// Slot ids for the edge tokens, index-aligned with `key`.
    value: Vec<SlotId>,
    parent: NodeId,
    /// Children keyed by the first token of their edge label.
    children: ahash::AHashMap<u32, NodeId>,
    /// Number of live requests relying on this node or a descendant.
    lock_ref: u32,
    last_access: u64,
}

impl Node {
    fn tombstone() -> Self {
        Node {
            key: Vec::new(),
            value: Vec::new(),
            parent: RadixCache::ROOT,
            children: ahash::AHashMap::new(),
            lock_ref: 0,
            last_access: 0,
        }
    }
}

impl RadixCache {
    /// The root node, representing the empty prefix. Never evicted.
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        let mut root = Node::tombstone();
        root.lock_ref = 1; // root is permanently protected
        Self {
            nodes: vec![root],
            free_nodes: Vec::new(),
            tick: 0,
            evictable_size: 0,
        }
    }

    /// Walk the tree consuming the longest cached prefix of `token_ids`.
    ///
    /// Returns the slot ids covering the matched prefix and the node at the
    /// match boundary (the root if nothing matched). If the walk ends partway
    /// through an edge, the edge is split so the boundary is always an exact
    /// node; the split only restructures the tree, slot ids are untouched.
    ///
    /// Matching refreshes recency but takes no lock; callers that keep
    /// running on the matched prefix must `inc_lock_ref` the returned node.
    pub fn match_prefix(&mut self, token_ids: &[u32]) -> (Vec<SlotId>, NodeId) {
        let mut slots = Vec::new();
        let mut node = Self::ROOT;
        let mut rest = token_ids;
        self.touch(Self::ROOT);

        while !rest.is_empty() {
            let Some(&child) = self.nodes[node].children.get(&rest[0]) else {
                break;
            };
            let shared = shared_prefix_len(&self.nodes[child].key, rest);
            if shared < self.nodes[child].key.len() {
                let boundary = self.split_node(child, shared);
                slots.extend_from_slice(&self.nodes[boundary].value);
                node = boundary;
                break;
            }
            self.touch(child);
            slots.extend_from_slice(&self.nodes[child].value);
            rest = &rest[shared..];
            node = child;
        }
        (slots, node)
    }

    /// Insert `token_ids` with their assigned slot ids.
    ///
    /// Returns the length of the prefix that was already cached. The existing
    /// nodes keep their original slot ids over that overlap; only the new
    /// suffix references entries of `slots`. The caller is responsible for
    /// releasing its duplicate slots over the overlap (see `cache_req`).
    pub fn insert(&mut self, token_ids: &[u32], slots: &[SlotId]) -> usize {
        assert_eq!(
            token_ids.len(),
            slots.len(),
            "one slot per inserted token required"
        );
        let mut node = Self::ROOT;
        let mut pos = 0;
        self.touch(Self::ROOT);

        loop {
            let rest = &token_ids[pos..];
            if rest.is_empty() {
                return pos;
            }
            match self.nodes[node].children.get(&rest[0]).copied() {
                Some(child) => {
                    let shared = shared_prefix_len(&self.nodes[child].key, rest);
                    if shared == self.nodes[child].key.len() {
                        self.touch(child);
                        pos += shared;
                        node = child;
                    } else {
                        // Diverges partway through the edge: split, then the
                        // next iteration hangs the remainder below the boundary.
                        let boundary = self.split_node(child, shared);
                        pos += shared;
                        node = boundary;
                    }
                }
                None => {
                    let leaf = self.new_node(rest.to_vec(), slots[pos..].to_vec(), node);
                    self.nodes[node].children.insert(rest[0], leaf);
                    // Fresh content starts unlocked.
                    self.evictable_size += rest.len();
                    return pos;
                }
            }
        }
    }

    /// Cache the computed span of a request's slot row.
    ///
    /// `row_slots` holds the request's per-position slot ids for all of
    /// `token_ids`; positions before `last_uncached_pos` were matched from the
    /// tree at admission and are already cached. The span beyond that boundary
    /// is inserted, and wherever the tree already held those tokens the
    /// request's duplicate slots are released through `dec_ref`.
    ///
    /// Returns the canonical cached slots for the full sequence and the node
    /// now covering it, so the caller can rewrite its slot-table row and move
    /// its lock to the new boundary.
    pub fn cache_req<F>(
        &mut self,
        token_ids: &[u32],
        last_uncached_pos: usize,
        row_slots: &[SlotId],
        dec_ref: &mut F,
    ) -> (Vec<SlotId>, NodeId)
    where
        F: FnMut(&[SlotId]) -> usize,
    {
        debug_assert!(last_uncached_pos <= token_ids.len());
        let new_prefix_len = self.insert(token_ids, row_slots);
        // The span [last_uncached_pos, new_prefix_len) was computed by this
        // request but already cached by another; its slots are duplicates.
        if new_prefix_len > last_uncached_pos {
            dec_ref(&row_slots[last_uncached_pos..new_prefix_len]);
        }
        let (cached, node) = self.match_prefix(token_ids);
        debug_assert_eq!(cached.len(), token_ids.len());
        (cached, node)
    }

    /// Lock the path from `node` to the root, protecting it from eviction.
    ///
    /// Returns the number of slots that were evictable before and no longer
    /// are. Locking the root is a no-op.
    pub fn inc_lock_ref(&mut self, mut node: NodeId) -> usize {
        let mut protected = 0;
        while node != Self::ROOT {
            if self.nodes[node].lock_ref == 0 {
                protected += self.nodes[node].value.len();
                self.evictable_size -= self.nodes[node].value.len();
            }
            self.nodes[node].lock_ref += 1;
            node = self.nodes[node].parent;
        }
        protected
    }

    /// Release one lock on the path from `node` to the root.
    ///
    /// Returns the number of slots that became evictable. Nothing is freed
    /// here; reclamation happens only through `evict`.
    pub fn dec_lock_ref(&mut self, mut node: NodeId) -> usize {
        let mut released = 0;
        while node != Self::ROOT {
            debug_assert!(
                self.nodes[node].lock_ref > 0,
                "unlock of an unlocked node"
            );
            if self.nodes[node].lock_ref == 1 {
                released += self.nodes[node].value.len();
                self.evictable_size += self.nodes[node].value.len();
            }
            self.nodes[node].lock_ref -= 1;
            node = self.nodes[node].parent;
        }
        released
    }

    /// Evict unlocked leaves until `need` slots are reclaimed (LRU order).
    ///
    /// `dec_ref` is invoked with each removed leaf's slot ids and reports how
    /// many slots actually became free. An interior node whose last child is
    /// removed becomes a leaf and is eligible in the same pass. Returns the
    /// number of slots reclaimed, which is less than `need` when every
    /// remaining node is locked; the caller must re-check availability.
    pub fn evict<F>(&mut self, need: usize, dec_ref: &mut F) -> usize
    where
        F: FnMut(&[SlotId]) -> usize,
    {
        // Live non-root nodes always carry a non-empty edge label, which
        // distinguishes them from tombstoned arena entries.
        let mut leaves: BinaryHeap<Reverse<(u64, NodeId)>> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(id, n)| {
                *id != Self::ROOT && !n.key.is_empty() && n.children.is_empty()
            })
            .map(|(id, n)| Reverse((n.last_access, id)))
            .collect();

        let mut reclaimed = 0;
        while reclaimed < need {
            let Some(Reverse((_, leaf))) = leaves.pop() else {
                break;
            };
            if self.nodes[leaf].lock_ref > 0 {
                continue;
            }
            let value = std::mem::take(&mut self.nodes[leaf].value);
            reclaimed += dec_ref(&value);
            self.evictable_size -= value.len();
            let parent = self.remove_leaf(leaf);
            if parent != Self::ROOT && self.nodes[parent].children.is_empty() {
                leaves.push(Reverse((self.nodes[parent].last_access, parent)));
            }
        }
        reclaimed
    }

    /// Total slots held by unlocked (reclaimable) nodes.
    pub fn evictable_size(&self) -> usize {
        self.evictable_size
    }

    /// Total slots referenced by the tree, locked or not.
    pub fn total_size(&self) -> usize {
        // Tombstoned entries hold empty values, so a plain sum is correct.
        self.nodes.iter().map(|n| n.value.len()).sum()
    }

    /// Drop every cached entry and start from an empty tree.
    ///
    /// The tree forgets its slot ids without touching reference counts; the
    /// caller must have released them (e.g. via `evict`) beforehand.
    pub fn clear(&mut self) {
        let mut root = Node::tombstone();
        root.lock_ref = 1;
        self.nodes = vec![root];
        self.free_nodes.clear();
        self.tick = 0;
        self.evictable_size = 0;
    }

    fn touch(&mut self, node: NodeId) {
        self.tick += 1;
        self.nodes[node].last_access = self.tick;
    }

    fn new_node(&mut self, key: Vec<u32>, value: Vec<SlotId>, parent: NodeId) -> NodeId {
        debug_assert!(!key.is_empty());
        debug_assert_eq!(key.len(), value.len());
        self.tick += 1;
        let node = Node {
            key,
            value,
            parent,
            children: ahash::AHashMap::new(),
            lock_ref: 0,
            last_access: self.tick,
        };
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Split `child`'s edge after `split_len` tokens, returning the new
    /// boundary node that takes over the prefix half.
    ///
    /// The deeper half keeps `child`'s id, so node handles held by requests
    /// whose match extends past the split stay valid, and their lock walks
    /// pass through the boundary, which inherits `child`'s lock count.
    fn split_node(&mut self, child: NodeId, split_len: usize) -> NodeId {
        debug_assert!(split_len > 0 && split_len < self.nodes[child].key.len());
        let parent = self.nodes[child].parent;
        let suffix_key = self.nodes[child].key.split_off(split_len);
        let suffix_value = self.nodes[child].value.split_off(split_len);
        let prefix_key = std::mem::replace(&mut self.nodes[child].key, suffix_key);
        let prefix_value = std::mem::replace(&mut self.nodes[child].value, suffix_value);
        let first_prefix_token = prefix_key[0];
        let lock_ref = self.nodes[child].lock_ref;

        let boundary = self.new_node(prefix_key, prefix_value, parent);
        self.nodes[boundary].lock_ref = lock_ref;
        let first_suffix_token = self.nodes[child].key[0];
        self.nodes[boundary].children.insert(first_suffix_token, child);
        self.nodes[child].parent = boundary;
        self.nodes[parent].children.insert(first_prefix_token, boundary);
        boundary
    }

    /// Unlink a childless node and recycle its arena entry. Returns the parent.
    fn remove_leaf(&mut self, leaf: NodeId) -> NodeId {
        debug_assert!(self.nodes[leaf].children.is_empty());
        let parent = self.nodes[leaf].parent;
        let first_token = self.nodes[leaf].key[0];
        let removed = self.nodes[parent].children.remove(&first_token);
        debug_assert_eq!(removed, Some(leaf));
        self.nodes[leaf] = Node::tombstone();
        self.free_nodes.push(leaf);
        parent
    }

    #[cfg(test)]
    pub(crate) fn lock_ref(&self, node: NodeId) -> u32 {
        self.nodes[node].lock_ref
    }

    #[cfg(test)]
    pub(crate) fn num_live_nodes(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }
}

impl Default for RadixCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest common prefix of two token sequences.
fn shared_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
