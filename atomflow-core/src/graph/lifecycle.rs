//! Lifecycle Collector
//!
//! Derived atoms are activated implicitly, the first time something watches,
//! subscribes to or reads them. Deactivation is the collector's job.
//!
//! # How It Works
//!
//! Whenever a derived atom loses its last observer or its last dependent it
//! becomes a candidate. Candidates are not torn down on the spot: the runtime
//! defers a collection by one macrotask tick (plus the configured delay), so
//! an unsubscribe immediately followed by a re-subscribe costs nothing.
//!
//! When the collection runs, each candidate is asked to deactivate. A node
//! that picked up an observer in the meantime declines. A node that does
//! deactivate hands back the dependencies it released, and those that are
//! now unobserved become candidates of the same collection.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::node::{AnyNode, NodeId};

#[derive(Default)]
struct Candidates {
    nodes: IndexMap<NodeId, Arc<dyn AnyNode>>,

    /// Whether a collection is scheduled or running.
    running: bool,
}

/// The garbage-collection queue of one runtime.
#[derive(Default)]
pub(crate) struct Collector {
    candidates: Mutex<Candidates>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deactivation candidate.
    ///
    /// Returns `true` when the caller must schedule a collection.
    pub fn request(&self, node: Arc<dyn AnyNode>) -> bool {
        let mut candidates = self.candidates.lock();
        candidates.nodes.insert(node.id(), node);
        !std::mem::replace(&mut candidates.running, true)
    }

    /// Deactivate every candidate that is still unobserved.
    ///
    /// Returns the number of nodes that were deactivated.
    pub fn collect(&self) -> usize {
        let mut collected = 0;
        loop {
            let node = {
                let mut candidates = self.candidates.lock();
                match candidates.nodes.shift_remove_index(0) {
                    Some((_, node)) => node,
                    None => {
                        candidates.running = false;
                        break;
                    }
                }
            };

            let Some(released) = node.deactivate() else {
                trace!(node = %node.id(), "gc candidate kept");
                continue;
            };
            debug!(node = %node.id(), released = released.len(), "deactivated");
            collected += 1;

            // Filter before locking: dropping the last handle of a node
            // re-enters the collector.
            let released: Vec<_> = released
                .into_iter()
                .filter(|dependency| dependency.is_collectable())
                .collect();
            let mut candidates = self.candidates.lock();
            for dependency in released {
                candidates.nodes.insert(dependency.id(), dependency);
            }
        }
        collected
    }

    /// Number of queued candidates.
    pub fn len(&self) -> usize {
        self.candidates.lock().nodes.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Dependents, Flags, NodeKind};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    struct MockNode {
        id: NodeId,
        flags: Flags,
        observed: AtomicBool,
        active: AtomicBool,
        deactivations: AtomicI32,
        dependencies: parking_lot::Mutex<Vec<Arc<dyn AnyNode>>>,
    }

    impl MockNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::new(),
                flags: Flags::default(),
                observed: AtomicBool::new(false),
                active: AtomicBool::new(true),
                deactivations: AtomicI32::new(0),
                dependencies: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl AnyNode for MockNode {
        fn id(&self) -> NodeId {
            self.id
        }
        fn kind(&self) -> NodeKind {
            NodeKind::Derived
        }
        fn flags(&self) -> &Flags {
            &self.flags
        }
        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
        fn is_settled(&self) -> bool {
            true
        }
        fn generation(&self) -> u64 {
            0
        }
        fn commit(&self) -> bool {
            true
        }
        fn execute(&self) {}
        fn propagate(&self) {}
        fn dependents(&self) -> Dependents {
            Dependents::new()
        }
        fn add_dependent(&self, _dependent: &Arc<dyn AnyNode>) {}
        fn remove_dependent(&self, _id: NodeId) {}
        fn track(&self, dependency: Arc<dyn AnyNode>) {
            self.dependencies.lock().push(dependency);
        }
        fn is_collectable(&self) -> bool {
            self.is_active() && !self.observed.load(Ordering::SeqCst)
        }
        fn deactivate(&self) -> Option<Vec<Arc<dyn AnyNode>>> {
            if !self.is_collectable() {
                return None;
            }
            self.active.store(false, Ordering::SeqCst);
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            Some(std::mem::take(&mut *self.dependencies.lock()))
        }
    }

    #[test]
    fn request_schedules_once_per_collection() {
        let collector = Collector::new();
        let a = MockNode::new();
        let b = MockNode::new();

        assert!(collector.request(a.clone()));
        assert!(!collector.request(b.clone()));
        assert!(!collector.request(a.clone()));
        assert_eq!(collector.len(), 2);

        assert_eq!(collector.collect(), 2);
        assert!(collector.request(a));
    }

    #[test]
    fn observed_candidates_are_kept() {
        let collector = Collector::new();
        let node = MockNode::new();
        node.observed.store(true, Ordering::SeqCst);

        collector.request(node.clone());
        assert_eq!(collector.collect(), 0);
        assert!(node.is_active());
    }

    #[test]
    fn released_dependencies_are_collected_transitively() {
        let collector = Collector::new();
        let top = MockNode::new();
        let middle = MockNode::new();
        let bottom = MockNode::new();
        let kept = MockNode::new();
        kept.observed.store(true, Ordering::SeqCst);

        top.track(middle.clone());
        top.track(kept.clone());
        middle.track(bottom.clone());

        collector.request(top.clone());
        assert_eq!(collector.collect(), 3);

        assert!(!top.is_active());
        assert!(!middle.is_active());
        assert!(!bottom.is_active());
        assert!(kept.is_active());
        assert_eq!(bottom.deactivations.load(Ordering::SeqCst), 1);
    }
}
