//! Graph Nodes
//!
//! This module defines the type-erased view of an atom that the scheduler and
//! the lifecycle collector operate on. The typed record lives in
//! `reactive::atom`; everything here only needs identity, edges and flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A source node. These are externally settable leaves: they have no
    /// dependencies and are always active.
    Source,

    /// A derived node. It is computed from the nodes it reads, caches its
    /// result and can be deactivated when nothing observes it.
    Derived,
}

/// Scheduling flags of a node.
///
/// These are only touched from the flush/execute call stack, so relaxed
/// ordering would do; `SeqCst` keeps the reasoning simple.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    /// Visited by the current mark phase.
    marked: AtomicBool,

    /// The node must run its computation when the flush reaches it.
    need_execute: AtomicBool,

    /// The node is queued, or has a result that must be propagated.
    need_propagate: AtomicBool,
}

impl Flags {
    /// Set the mark. Returns `true` if the node was not marked before.
    pub fn mark(&self) -> bool {
        !self.marked.swap(true, Ordering::SeqCst)
    }

    pub fn unmark(&self) {
        self.marked.store(false, Ordering::SeqCst);
    }

    /// Whether the node is waiting to be processed by a running flush.
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    /// Request execution. Returns `true` if it was not requested before.
    pub fn request_execute(&self) -> bool {
        !self.need_execute.swap(true, Ordering::SeqCst)
    }

    pub fn needs_execute(&self) -> bool {
        self.need_execute.load(Ordering::SeqCst)
    }

    pub fn clear_execute(&self) {
        self.need_execute.store(false, Ordering::SeqCst);
    }

    /// Request propagation. Returns `true` if it was not requested before.
    pub fn request_propagate(&self) -> bool {
        !self.need_propagate.swap(true, Ordering::SeqCst)
    }

    pub fn needs_propagate(&self) -> bool {
        self.need_propagate.load(Ordering::SeqCst)
    }

    pub fn clear_propagate(&self) {
        self.need_propagate.store(false, Ordering::SeqCst);
    }

    /// Reset every flag, used on deactivation.
    pub fn clear(&self) {
        self.marked.store(false, Ordering::SeqCst);
        self.need_execute.store(false, Ordering::SeqCst);
        self.need_propagate.store(false, Ordering::SeqCst);
    }
}

/// Snapshot of a node's dependents, taken so no lock is held while walking.
pub(crate) type Dependents = SmallVec<[Arc<dyn AnyNode>; 4]>;

/// A type-erased node in the dependency graph.
///
/// Implementations must never hold their internal lock while calling into
/// another node or into user code.
pub(crate) trait AnyNode: Send + Sync {
    /// The node's identity.
    fn id(&self) -> NodeId;

    /// Whether this is a source or a derived node.
    fn kind(&self) -> NodeKind;

    /// Scheduling flags.
    fn flags(&self) -> &Flags;

    /// Whether the node currently participates in propagation.
    fn is_active(&self) -> bool;

    /// Whether the node holds a clean value (not pending, not errored).
    fn is_settled(&self) -> bool;

    /// The current execution generation.
    fn generation(&self) -> u64;

    /// Move staged data into the node's state.
    ///
    /// Returns `false` when nothing changed and the node should not be
    /// marked (a source whose staged write was withdrawn).
    fn commit(&self) -> bool;

    /// Run the node's computation. A no-op for sources.
    fn execute(&self);

    /// Notify watchers and subscribers and flag dependents for execution.
    fn propagate(&self);

    /// Live dependents of this node.
    fn dependents(&self) -> Dependents;

    /// Register `dependent` as reading this node.
    fn add_dependent(&self, dependent: &Arc<dyn AnyNode>);

    /// Forget a dependent.
    fn remove_dependent(&self, id: NodeId);

    /// Record `dependency` as read by the running execution.
    fn track(&self, dependency: Arc<dyn AnyNode>);

    /// Whether the node could be deactivated right now.
    fn is_collectable(&self) -> bool;

    /// Deactivate the node if it is still collectable.
    ///
    /// Returns the dependencies that were unlinked, or `None` if the node
    /// gained an observer in the meantime and was left alone.
    fn deactivate(&self) -> Option<Vec<Arc<dyn AnyNode>>>;
}

impl fmt::Debug for dyn AnyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyNode")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn node_id_displays_with_hash() {
        assert_eq!(NodeId::from(7).to_string(), "#7");
        assert_eq!(NodeId::from(7).raw(), 7);
    }

    #[test]
    fn flags_report_first_request_only() {
        let flags = Flags::default();

        assert!(flags.mark());
        assert!(!flags.mark());
        assert!(flags.is_marked());
        flags.unmark();
        assert!(flags.mark());

        assert!(flags.request_execute());
        assert!(!flags.request_execute());
        assert!(flags.needs_execute());
        flags.clear_execute();
        assert!(!flags.needs_execute());

        assert!(flags.request_propagate());
        assert!(flags.needs_propagate());
        flags.clear();
        assert!(!flags.needs_propagate());
        assert!(flags.mark());
    }
}
