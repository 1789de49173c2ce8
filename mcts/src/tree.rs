//! Arena-backed search tree with handle addressing and slot recycling.
//!
//! All nodes live in a contiguous arena indexed by [`NodeId`]; a parallel
//! adjacency table maps each node to its ordered child handles. One
//! readers-writer lock guards structure (arena growth, adjacency, root,
//! free lists); per-node statistics are atomics, so backups and selection
//! proceed under the shared lock while expansion and reclamation take the
//! exclusive lock.
//!
//! Accessors copy data out instead of handing out references: arena growth
//! may relocate the node storage, so no caller holds a node reference
//! across a lock release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::node::{Node, NodeId, Status};

/// Hard cap on live nodes. At roughly 50 bytes per node this bounds the
/// arena near 1.2 GB.
pub const MAX_TREE_SIZE: usize = 25_000_000;

/// Arena slots reserved up front.
const INITIAL_ARENA_CAPACITY: usize = 12_288;

/// Snapshot of one child taken under the shared lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildStat {
    pub id: NodeId,
    pub mv: i32,
    pub visits: u32,
    pub prior: f32,
    pub status: Status,
}

struct Store {
    nodes: Vec<Node>,
    children: Vec<Vec<NodeId>>,
    free_list: Vec<NodeId>,
    freeables: Vec<NodeId>,
    root: NodeId,
}

impl Store {
    fn alloc_slot(&mut self, child_hint: usize) -> NodeId {
        if let Some(handle) = self.free_list.pop() {
            debug_assert_eq!(self.nodes[handle.index()].status(), Status::Invalid);
            return handle;
        }
        let handle = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::empty());
        self.children.push(Vec::with_capacity(child_hint));
        handle
    }

    fn free_slot(&mut self, handle: NodeId) {
        debug_assert_eq!(self.nodes[handle.index()].status(), Status::Invalid);
        self.children[handle.index()].clear();
        self.nodes[handle.index()].reset();
        self.free_list.push(handle);
    }

    /// Mark `handle` and every descendant Invalid and queue them for
    /// reclamation at the next quiescent point.
    fn invalidate_subtree(&mut self, handle: NodeId) {
        self.nodes[handle.index()].set_status(Status::Invalid);
        self.freeables.push(handle);
        let kids = std::mem::take(&mut self.children[handle.index()]);
        for kid in kids {
            self.invalidate_subtree(kid);
        }
    }

    fn count_active(&self, handle: NodeId) -> usize {
        let mut total = 0;
        if self.nodes[handle.index()].is_active() {
            total += 1;
        }
        for &kid in &self.children[handle.index()] {
            total += self.count_active(kid);
        }
        total
    }
}

/// The shared search tree.
pub struct Tree {
    store: RwLock<Store>,
    /// Approximate count of live active nodes; the expansion gate.
    nc: AtomicUsize,
    max_tree_size: usize,
    /// Capacity hint for adjacency rows (the game's action-space size).
    child_hint: usize,
}

impl Tree {
    pub fn new(child_hint: usize, max_tree_size: usize) -> Self {
        Self {
            store: RwLock::new(Store {
                nodes: Vec::with_capacity(INITIAL_ARENA_CAPACITY),
                children: Vec::with_capacity(INITIAL_ARENA_CAPACITY),
                free_list: Vec::new(),
                freeables: Vec::new(),
                root: NodeId::NONE,
            }),
            nc: AtomicUsize::new(0),
            max_tree_size,
            child_hint,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> NodeId {
        self.read().root
    }

    /// Total arena slots, live or free.
    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nc.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn at_capacity(&self) -> bool {
        self.node_count() >= self.max_tree_size
    }

    pub(crate) fn reset_node_count(&self, count: usize) {
        self.nc.store(count, Ordering::Relaxed);
    }

    /// Replace the root with a fresh node carrying the unset move
    /// sentinel. Any previous root subtree is invalidated and queued for
    /// reclamation.
    pub fn fresh_root(&self) -> NodeId {
        let mut store = self.write();
        let old = store.root;
        if old.is_some() {
            store.invalidate_subtree(old);
        }
        let hint = self.child_hint;
        let handle = store.alloc_slot(hint);
        store.nodes[handle.index()].init(-1, 0.0);
        store.root = handle;
        handle
    }

    /// Promote `new_root` (a child of the current root) to root. Every
    /// sibling subtree and the old root itself are invalidated and queued.
    pub fn promote_root(&self, new_root: NodeId) {
        let mut store = self.write();
        let old = store.root;
        debug_assert!(old.is_some());
        let kids = std::mem::take(&mut store.children[old.index()]);
        for kid in kids {
            if kid != new_root {
                store.invalidate_subtree(kid);
            }
        }
        store.nodes[old.index()].set_status(Status::Invalid);
        store.freeables.push(old);
        store.root = new_root;
    }

    /// Recycle everything invalidated since the previous search.
    pub fn drain_freeables(&self) {
        let mut store = self.write();
        let pending = std::mem::take(&mut store.freeables);
        for handle in pending {
            store.free_slot(handle);
        }
    }

    /// Active-node count of the subtree rooted at `handle`.
    pub fn count_active(&self, handle: NodeId) -> usize {
        self.read().count_active(handle)
    }

    /// Ordered child handles of `handle`.
    pub fn children(&self, handle: NodeId) -> Vec<NodeId> {
        self.read().children[handle.index()].clone()
    }

    pub(crate) fn child_stats(&self, handle: NodeId) -> Vec<ChildStat> {
        let store = self.read();
        store.children[handle.index()]
            .iter()
            .map(|&kid| {
                let node = &store.nodes[kid.index()];
                let (visits, _) = node.stats();
                ChildStat {
                    id: kid,
                    mv: node.mv(),
                    visits,
                    prior: node.prior(),
                    status: node.status(),
                }
            })
            .collect()
    }

    /// First valid child of `parent` whose move index equals `mv`.
    pub fn find_child(&self, parent: NodeId, mv: i32) -> Option<NodeId> {
        let store = self.read();
        store.children[parent.index()]
            .iter()
            .copied()
            .find(|kid| {
                let node = &store.nodes[kid.index()];
                node.is_valid() && node.mv() == mv
            })
    }

    pub fn visits(&self, handle: NodeId) -> u32 {
        self.read().nodes[handle.index()].visits()
    }

    pub fn qsa(&self, handle: NodeId) -> f32 {
        self.read().nodes[handle.index()].qsa()
    }

    pub fn prior(&self, handle: NodeId) -> f32 {
        self.read().nodes[handle.index()].prior()
    }

    pub fn move_of(&self, handle: NodeId) -> i32 {
        self.read().nodes[handle.index()].mv()
    }

    pub fn status_of(&self, handle: NodeId) -> Status {
        self.read().nodes[handle.index()].status()
    }

    pub fn pi_of(&self, handle: NodeId) -> f32 {
        self.read().nodes[handle.index()].pi()
    }

    pub fn has_children(&self, handle: NodeId) -> bool {
        self.read().nodes[handle.index()].has_children()
    }

    /// Fold one backed-up value into `handle`'s running mean.
    pub fn update(&self, handle: NodeId, value: f32) {
        self.read().nodes[handle.index()].update(value);
    }

    /// PUCT child selection:
    /// `score(c) = Q(c) + puct * P(c) * sqrt(sum_visits) / (1 + N(c))`,
    /// with `fpu` standing in for Q on unvisited children. Visits are
    /// summed over all valid children; only Active children are
    /// candidates. Returns `None` when no Active child exists.
    pub fn select_child(&self, parent: NodeId, puct: f32, fpu: f32) -> Option<NodeId> {
        let store = self.read();
        let kids = &store.children[parent.index()];

        let mut parent_visits: u32 = 0;
        for &kid in kids {
            let node = &store.nodes[kid.index()];
            if node.is_valid() {
                parent_visits += node.visits();
            }
        }
        let numerator = (parent_visits as f32).sqrt();

        let mut best = NodeId::NONE;
        let mut best_score = f32::NEG_INFINITY;
        for &kid in kids {
            let node = &store.nodes[kid.index()];
            if !node.is_active() {
                continue;
            }
            let (visits, qsa) = node.stats();
            let q = if visits > 0 { qsa } else { fpu };
            let u = puct * node.prior() * numerator / (1.0 + visits as f32);
            let score = q + u;
            if score > best_score {
                best_score = score;
                best = kid;
            }
        }

        if best.is_none() {
            None
        } else {
            Some(best)
        }
    }

    /// Attach children to `parent`, one per `(move, prior)` pair, in the
    /// given order. Returns false without touching the tree when `parent`
    /// was already expanded by another worker; the re-check and the final
    /// `has_children` store bracket the append so selectors never observe
    /// a partially linked child list.
    pub fn expand(&self, parent: NodeId, pairs: &[(i32, f32)]) -> bool {
        let mut store = self.write();
        if store.nodes[parent.index()].has_children() {
            return false;
        }
        let hint = self.child_hint;
        for &(mv, prior) in pairs {
            let kid = store.alloc_slot(hint);
            store.nodes[kid.index()].init(mv, prior);
            store.children[parent.index()].push(kid);
        }
        store.nodes[parent.index()].set_has_children();
        self.nc.fetch_add(pairs.len(), Ordering::Relaxed);
        true
    }

    /// Mix a noise vector into the priors of `root`'s active children:
    /// `p' = (1-eps)*p + eps*noise[mv]`.
    pub(crate) fn perturb_priors(&self, root: NodeId, noise: &[f32], epsilon: f32) {
        let mut store = self.write();
        let kids = store.children[root.index()].clone();
        for kid in kids {
            let node = &mut store.nodes[kid.index()];
            if !node.is_active() {
                continue;
            }
            let mv = node.mv();
            if mv >= 0 {
                if let Some(&eta) = noise.get(mv as usize) {
                    node.psa = (1.0 - epsilon) * node.psa + epsilon * eta;
                }
            }
        }
    }

    /// Record improved-policy masses on root children after a search.
    pub(crate) fn assign_pi(&self, values: &[(NodeId, f32)]) {
        let mut store = self.write();
        for &(handle, pi) in values {
            store.nodes[handle.index()].pi = pi;
        }
    }

    /// Drop every node and recycle nothing: the arena starts over.
    pub(crate) fn clear(&self) {
        let mut store = self.write();
        store.nodes.clear();
        store.children.clear();
        store.free_list.clear();
        store.freeables.clear();
        store.root = NodeId::NONE;
        self.nc.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_root() -> (Tree, NodeId) {
        let tree = Tree::new(9, MAX_TREE_SIZE);
        let root = tree.fresh_root();
        (tree, root)
    }

    #[test]
    fn fresh_root_carries_unset_move() {
        let (tree, root) = tree_with_root();
        assert_eq!(tree.root(), root);
        assert_eq!(tree.move_of(root), -1);
        assert_eq!(tree.status_of(root), Status::Active);
        assert!(!tree.has_children(root));
    }

    #[test]
    fn expand_links_children_in_order() {
        let (tree, root) = tree_with_root();
        assert!(tree.expand(root, &[(4, 0.5), (0, 0.3), (8, 0.2)]));
        assert!(tree.has_children(root));

        let kids = tree.children(root);
        assert_eq!(kids.len(), 3);
        assert_eq!(tree.move_of(kids[0]), 4);
        assert_eq!(tree.move_of(kids[1]), 0);
        assert_eq!(tree.move_of(kids[2]), 8);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn expand_is_refused_once_expanded() {
        let (tree, root) = tree_with_root();
        assert!(tree.expand(root, &[(0, 1.0)]));
        assert!(!tree.expand(root, &[(1, 1.0)]));
        assert_eq!(tree.children(root).len(), 1);
    }

    #[test]
    fn select_prefers_prior_when_unvisited() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(1, 0.7), (0, 0.3)]);
        let kids = tree.children(root);

        let best = tree.select_child(root, 1.0, 0.0).unwrap();
        assert_eq!(best, kids[0]);
    }

    #[test]
    fn select_balances_value_and_exploration() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.5), (1, 0.5)]);
        let kids = tree.children(root);

        // Drive the first child's value down; the second should win.
        for _ in 0..10 {
            tree.update(kids[0], -1.0);
        }
        let best = tree.select_child(root, 1.0, 0.0).unwrap();
        assert_eq!(best, kids[1]);
    }

    #[test]
    fn select_skips_invalid_and_fails_without_active() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.9), (1, 0.1)]);
        let kids = tree.children(root);

        {
            let store = tree.read();
            store.nodes[kids[0].index()].set_status(Status::Invalid);
        }
        assert_eq!(tree.select_child(root, 1.0, 0.0), Some(kids[1]));

        {
            let store = tree.read();
            store.nodes[kids[1].index()].set_status(Status::Pruned);
        }
        assert_eq!(tree.select_child(root, 1.0, 0.0), None);
    }

    #[test]
    fn fpu_stands_in_for_unvisited_q() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.5), (1, 0.5)]);
        let kids = tree.children(root);

        // Equal priors, child 0 visited with a mild positive value. A
        // strongly optimistic fpu makes the unvisited child win anyway.
        tree.update(kids[0], 0.2);
        let best = tree.select_child(root, 0.1, 0.9).unwrap();
        assert_eq!(best, kids[1]);
    }

    #[test]
    fn promote_root_invalidates_siblings_recursively() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.6), (1, 0.4)]);
        let kids = tree.children(root);
        tree.expand(kids[1], &[(2, 1.0)]);
        let grandkid = tree.children(kids[1])[0];

        tree.promote_root(kids[0]);

        assert_eq!(tree.root(), kids[0]);
        assert_eq!(tree.status_of(kids[0]), Status::Active);
        assert_eq!(tree.status_of(root), Status::Invalid);
        assert_eq!(tree.status_of(kids[1]), Status::Invalid);
        assert_eq!(tree.status_of(grandkid), Status::Invalid);
    }

    #[test]
    fn drained_slots_are_recycled() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.6), (1, 0.4)]);
        let kids = tree.children(root);
        tree.promote_root(kids[0]);

        let before = tree.len();
        tree.drain_freeables();

        // Two slots (old root, discarded sibling) are back on the free
        // list; new allocations reuse them without growing the arena.
        tree.expand(kids[0], &[(5, 0.5), (6, 0.5)]);
        assert_eq!(tree.len(), before);
        for kid in tree.children(kids[0]) {
            assert_eq!(tree.status_of(kid), Status::Active);
        }
    }

    #[test]
    fn count_active_walks_the_subtree() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 0.6), (1, 0.4)]);
        let kids = tree.children(root);
        tree.expand(kids[0], &[(2, 1.0)]);

        assert_eq!(tree.count_active(root), 4);
        tree.promote_root(kids[0]);
        assert_eq!(tree.count_active(kids[0]), 2);
    }

    #[test]
    fn clear_empties_everything() {
        let (tree, root) = tree_with_root();
        tree.expand(root, &[(0, 1.0)]);
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.node_count(), 0);
        assert!(tree.root().is_none());
    }
}
