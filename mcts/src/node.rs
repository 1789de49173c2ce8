//! Node records and handles for the search arena.
//!
//! Nodes are addressed by dense [`NodeId`] indices into the tree's arena.
//! The hot statistics — visit count and mean action value — live together
//! in one atomic word so a backup is a single compare-exchange and readers
//! always observe a matching (visits, q) pair.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Index into the node arena. `NONE` is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn is_some(self) -> bool {
        !self.is_none()
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Free slot or logically deleted subtree member.
    Invalid = 0,
    /// In play: reachable and eligible for selection.
    Active = 1,
    /// Reachable but excluded from selection.
    Pruned = 2,
}

impl Status {
    fn from_u32(raw: u32) -> Status {
        match raw {
            1 => Status::Active,
            2 => Status::Pruned,
            _ => Status::Invalid,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Invalid => "Invalid",
            Status::Active => "Active",
            Status::Pruned => "Pruned",
        };
        f.write_str(name)
    }
}

/// Pack a (visits, q) pair into one 64-bit word: visits in the high half,
/// the f32 bit pattern of q in the low half.
#[inline]
fn pack(visits: u32, qsa: f32) -> u64 {
    ((visits as u64) << 32) | (qsa.to_bits() as u64)
}

#[inline]
fn unpack(word: u64) -> (u32, f32) {
    ((word >> 32) as u32, f32::from_bits(word as u32))
}

/// A node in the search tree.
///
/// `mv` and `psa` are written only while the tree's exclusive lock is held
/// (slot initialization, root prior perturbation between searches); the
/// statistics word, status, and expansion flag are atomics mutated by
/// workers under the shared lock. `pi` is assigned by policy extraction
/// after the driver has stopped.
pub struct Node {
    /// Action index that leads into this node from its parent; -1 unset.
    pub(crate) mv: i32,
    /// Prior P(s,a) assigned at expansion.
    pub(crate) psa: f32,
    /// Improved-policy mass assigned after a search (root children only).
    pub(crate) pi: f32,
    /// Packed (visits N(s,a), mean value Q(s,a)).
    stats: AtomicU64,
    status: AtomicU32,
    has_children: AtomicBool,
}

impl Node {
    /// A fresh, unfilled slot.
    pub(crate) fn empty() -> Self {
        Self {
            mv: -1,
            psa: 0.0,
            pi: 0.0,
            stats: AtomicU64::new(pack(0, 0.0)),
            status: AtomicU32::new(Status::Invalid as u32),
            has_children: AtomicBool::new(false),
        }
    }

    /// Fill a slot for play. Callers hold the tree's exclusive lock.
    pub(crate) fn init(&mut self, mv: i32, psa: f32) {
        self.mv = mv;
        self.psa = psa;
        self.pi = 0.0;
        self.stats = AtomicU64::new(pack(0, 0.0));
        self.status = AtomicU32::new(Status::Active as u32);
        self.has_children = AtomicBool::new(false);
    }

    /// Return a slot to its unfilled state before it re-enters the free
    /// list. Callers hold the tree's exclusive lock.
    pub(crate) fn reset(&mut self) {
        self.init(-1, 0.0);
        self.status = AtomicU32::new(Status::Invalid as u32);
    }

    /// Consistent (visits, q) snapshot.
    #[inline]
    pub fn stats(&self) -> (u32, f32) {
        unpack(self.stats.load(Ordering::Acquire))
    }

    #[inline]
    pub fn visits(&self) -> u32 {
        self.stats().0
    }

    #[inline]
    pub fn qsa(&self) -> f32 {
        self.stats().1
    }

    /// Fold one backed-up value into the running mean:
    /// `q' = (n*q + value) / (n + 1)`, `n' = n + 1`, as one atomic step.
    pub fn update(&self, value: f32) {
        let mut current = self.stats.load(Ordering::Acquire);
        loop {
            let (n, q) = unpack(current);
            let next = pack(
                n.saturating_add(1),
                (n as f32 * q + value) / (n as f32 + 1.0),
            );
            match self.stats.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u32(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u32, Ordering::Release);
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status() != Status::Invalid
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status() == Status::Active
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        self.has_children.load(Ordering::Acquire)
    }

    /// Publish the expansion. Stored last, after all children are linked.
    #[inline]
    pub(crate) fn set_has_children(&self) {
        self.has_children.store(true, Ordering::Release);
    }

    #[inline]
    pub fn prior(&self) -> f32 {
        self.psa
    }

    #[inline]
    pub fn mv(&self) -> i32 {
        self.mv
    }

    #[inline]
    pub fn pi(&self) -> f32 {
        self.pi
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (visits, qsa) = self.stats();
        f.debug_struct("Node")
            .field("mv", &self.mv)
            .field("visits", &visits)
            .field("qsa", &qsa)
            .field("psa", &self.psa)
            .field("status", &self.status())
            .field("has_children", &self.has_children())
            .finish()
    }
}
