//! Execution Context
//!
//! The execution context tracks which computation is running on the current
//! thread. Sources consult it to reject writes issued from inside a
//! computation, which would otherwise be able to introduce cycles.
//!
//! # Implementation
//!
//! We use a thread-local stack. Running a computation pushes its node ID;
//! calling observer callbacks pushes an empty entry, because watchers and
//! subscribers are allowed to write even when the flush that calls them was
//! triggered from inside a computation. Guards pop the entry on drop, so the
//! stack stays balanced when a computation panics.

use std::cell::RefCell;

use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Option<NodeId>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the context when dropped.
pub(crate) struct ExecutionContext {
    entry: Option<NodeId>,
}

impl ExecutionContext {
    /// Enter the context of the computation of `node`.
    pub fn enter(node: NodeId) -> Self {
        Self::push(Some(node))
    }

    /// Leave every computation context until the guard is dropped.
    pub fn detach() -> Self {
        Self::push(None)
    }

    fn push(entry: Option<NodeId>) -> Self {
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(entry));
        Self { entry }
    }

    /// Check if a computation is running on this thread.
    pub fn is_active() -> bool {
        Self::current().is_some()
    }

    /// The node whose computation is running, if any.
    pub fn current() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().copied().flatten())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(
                popped,
                Some(self.entry),
                "ExecutionContext mismatch: expected {:?}, got {:?}",
                self.entry,
                popped
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_node() {
        let id = NodeId::new();

        assert!(!ExecutionContext::is_active());
        assert!(ExecutionContext::current().is_none());

        {
            let _ctx = ExecutionContext::enter(id);
            assert!(ExecutionContext::is_active());
            assert_eq!(ExecutionContext::current(), Some(id));
        }

        assert!(!ExecutionContext::is_active());
    }

    #[test]
    fn nested_contexts() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        {
            let _ctx1 = ExecutionContext::enter(id1);
            {
                let _ctx2 = ExecutionContext::enter(id2);
                assert_eq!(ExecutionContext::current(), Some(id2));
            }
            assert_eq!(ExecutionContext::current(), Some(id1));
        }

        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn detach_hides_running_computation() {
        let id = NodeId::new();
        let _ctx = ExecutionContext::enter(id);

        {
            let _detached = ExecutionContext::detach();
            assert!(!ExecutionContext::is_active());
        }

        assert_eq!(ExecutionContext::current(), Some(id));
    }

    #[test]
    fn guard_pops_on_panic() {
        let id = NodeId::new();
        let result = std::panic::catch_unwind(|| {
            let _ctx = ExecutionContext::enter(id);
            panic!("computation failed");
        });

        assert!(result.is_err());
        assert!(!ExecutionContext::is_active());
    }
}
